use serde_json::{json, Value};

/// Top-level message commands understood by a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Playback state change from the master (pause, pos, volume, ...)
    State,
    /// One-shot action from the master (seek)
    Action,
    /// Media description payload from the master
    Desc,
    /// On-demand query from a member (desc, state)
    Req,
}

impl Command {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "state" => Some(Self::State),
            "action" => Some(Self::Action),
            "desc" => Some(Self::Desc),
            "req" => Some(Self::Req),
            _ => None,
        }
    }
}

/// View over one parsed wire message.
///
/// Wraps the raw JSON object instead of deserializing into a struct because
/// field *presence* carries meaning: `get` returns `None` for a key that was
/// not in the message at all, and `Some(Value::Null)` for an explicit null.
#[derive(Debug, Clone)]
pub struct Envelope {
    raw: Value,
}

impl Envelope {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Whether the field was present in the message, null or not.
    pub fn has(&self, field: &str) -> bool {
        self.raw.get(field).is_some()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.raw.get(field)
    }

    /// `None` when the command field is absent or not a known command.
    pub fn command(&self) -> Option<Command> {
        self.get("command")?.as_str().and_then(Command::parse)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")?.as_str()
    }

    pub fn value(&self) -> Option<&Value> {
        self.get("value")
    }

    /// Nested payload, itself wrapped as an envelope.
    pub fn extra(&self) -> Option<Envelope> {
        self.get("extra").map(|v| Envelope::new(v.clone()))
    }

    /// Sender-supplied clock, unix seconds.
    pub fn timestamp(&self) -> Option<f64> {
        self.get("timestamp")?.as_f64()
    }

    // Description leaves, read off the `extra` payload.

    pub fn filename(&self) -> Option<String> {
        self.get("filename")?.as_str().map(str::to_owned)
    }

    pub fn filesize(&self) -> Option<i64> {
        self.get("filesize")?.as_i64()
    }

    pub fn duration(&self) -> Option<i64> {
        self.get("duration")?.as_i64()
    }

    pub fn pos(&self) -> Option<f64> {
        self.get("pos")?.as_f64()
    }

    /// Serialize for fan-out. Hyphenated names go out with underscores so
    /// clients can use them as plain identifiers; absent fields render as
    /// explicit nulls.
    pub fn pack(&self) -> Value {
        json!({
            "command": self.get("command").cloned().unwrap_or(Value::Null),
            "name": self
                .name()
                .map(|n| Value::String(n.replace('-', "_")))
                .unwrap_or(Value::Null),
            "value": self.value().cloned().unwrap_or(Value::Null),
            "extra": self.get("extra").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_field_is_distinct_from_explicit_null() {
        let env = Envelope::new(json!({"command": "state", "value": null}));
        assert!(env.has("value"));
        assert_eq!(env.get("value"), Some(&Value::Null));
        assert!(!env.has("name"));
        assert_eq!(env.get("name"), None);
    }

    #[test]
    fn accessors_never_panic_on_junk() {
        let env = Envelope::new(json!({"command": 3, "name": {"x": 1}}));
        assert_eq!(env.command(), None);
        assert_eq!(env.name(), None);
        assert_eq!(env.timestamp(), None);
    }

    #[test]
    fn nested_extra_wraps_recursively() {
        let env = Envelope::new(json!({
            "command": "desc",
            "extra": {"filename": "a.mkv", "filesize": 42, "pos": 1.5}
        }));
        let extra = env.extra().unwrap();
        assert_eq!(extra.filename().as_deref(), Some("a.mkv"));
        assert_eq!(extra.filesize(), Some(42));
        assert_eq!(extra.pos(), Some(1.5));
        assert_eq!(extra.duration(), None);
    }

    #[test]
    fn pack_rewrites_hyphens_and_nulls_absent_fields() {
        let env = Envelope::new(json!({
            "command": "state",
            "name": "sub-delay",
            "value": 120,
        }));
        assert_eq!(
            env.pack(),
            json!({"command": "state", "name": "sub_delay", "value": 120, "extra": null})
        );
    }
}
