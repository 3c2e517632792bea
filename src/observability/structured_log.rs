/// ステージ単位の構造化JSONログ。
use serde_json::{Map, Value, json};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// `stage` フィールドを持つ INFO 以上のイベントを `textile.*` キーで stderr に出力するレイヤー。
pub(crate) struct StructuredLogLayer;

#[derive(Default)]
struct StageVisitor {
    values: Map<String, Value>,
    message: Option<String>,
}

impl StageVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.values
            .insert(format!("textile.{}", field.name()), value);
    }
}

impl Visit for StageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.insert(field, json!(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }
}

/// Renders a stage event, or `None` when the event is not a stage record.
fn render(event: &Event<'_>) -> Option<Value> {
    let metadata = event.metadata();
    if *metadata.level() > Level::INFO || metadata.fields().field("stage").is_none() {
        return None;
    }

    let mut visitor = StageVisitor::default();
    event.record(&mut visitor);

    Some(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": metadata.level().as_str(),
        "target": metadata.target(),
        "message": visitor.message.unwrap_or_default(),
        "fields": visitor.values,
    }))
}

impl<S: Subscriber> Layer<S> for StructuredLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if let Some(entry) = render(event) {
            eprintln!("{}", serde_json::to_string(&entry).unwrap_or_default());
        }
    }
}
