use std::sync::Once;

use tracing::{Event, Level, Metadata};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::Subscriber;

static INIT: Once = Once::new();

/// Installs a minimal global `tracing` dispatcher that writes `target:
/// "submerge"` events to stderr as `LEVEL target: message`. No spans, no
/// filtering beyond level — just enough for tests and a bare process to see
/// what the sync core is doing, without pulling in `tracing-subscriber`.
/// Idempotent: safe to call from every test that needs logging wired up.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing::subscriber::set_global_default(PlainSubscriber);
    });
}

struct PlainSubscriber;

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{}={:?}", field.name(), value);
        }
    }
}

impl Subscriber for PlainSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= Level::INFO
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = MessageVisitor { message: String::new() };
        event.record(&mut visitor);
        eprintln!(
            "{} {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.message
        );
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
