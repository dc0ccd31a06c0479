use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref EVENTS_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "cxs_events_dispatched_total",
        "Events dispatched to listeners",
        &["event_type"]
    )
    .unwrap();
    pub static ref RULES_FIRED: IntCounterVec = register_int_counter_vec!(
        "cxs_rules_fired_total",
        "Rules whose actions were executed",
        &["scope"]
    )
    .unwrap();
    pub static ref CASCADE_ABORTS: IntCounter = register_int_counter!(
        "cxs_cascade_aborts_total",
        "Event cascades stopped at the recursion limit"
    )
    .unwrap();
    pub static ref SAVE_FAILURES: IntCounter = register_int_counter!(
        "cxs_event_save_failures_total",
        "Persistent events that could not be saved"
    )
    .unwrap();
}
