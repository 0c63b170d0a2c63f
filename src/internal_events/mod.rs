mod access;
mod lifecycle;
mod namespace;
mod wait;

pub use self::access::*;
pub use self::lifecycle::*;
pub use self::namespace::*;
pub use self::wait::*;

pub trait InternalEvent {
    fn emit_logs(&self) {}
    fn emit_metrics(&self) {}
}

pub fn emit(event: impl InternalEvent) {
    event.emit_logs();
    event.emit_metrics();
}

#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::emit($event)
    };
}
