//! Message store and extraction of messages from responses and errors

use odata_trait::{
    HEADER_SAP_MESSAGES, Message, MessageDelta, MessageType, ODataError, Response, SKIPPED_MESSAGE,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// All messages currently surfaced by the model
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add(&mut self, messages: Vec<Message>) -> MessageDelta {
        let mut delta = MessageDelta::default();
        for message in messages {
            if self.messages.contains(&message) {
                continue;
            }
            self.messages.push(message.clone());
            delta.added.push(message);
        }
        delta
    }

    /// Replaces the messages of the data below `path` with `incoming`.
    ///
    /// Non-persistent messages within `path` are dropped unless they lie
    /// within one of `excluded`. Persistent messages are only dropped when a
    /// new message has the same target.
    pub fn replace(&mut self, path: &str, excluded: &[String], incoming: Vec<Message>) -> MessageDelta {
        let mut delta = MessageDelta::default();
        let mut kept = Vec::with_capacity(self.messages.len());
        for message in std::mem::take(&mut self.messages) {
            let owned_here = message.targets_within(path)
                && !excluded.iter().any(|other| message.targets_within(other));
            let superseded = owned_here
                && (!message.persistent
                    || incoming.iter().any(|new| new.target == message.target));
            if superseded && !incoming.contains(&message) {
                delta.removed.push(message);
            } else {
                kept.push(message);
            }
        }
        self.messages = kept;
        delta.extend(self.add(incoming));
        if !delta.is_empty() {
            debug!(
                "💬 Messages for {}: {} added, {} removed",
                path,
                delta.added.len(),
                delta.removed.len()
            );
        }
        delta
    }

    /// Removes every message within `path`, persistent or not
    pub fn remove_within(&mut self, path: &str) -> MessageDelta {
        let (removed, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|message| message.targets_within(path));
        self.messages = kept;
        MessageDelta {
            added: Vec::new(),
            removed,
        }
    }

    /// Moves targets from a transient path to the persisted one
    pub fn rename(&mut self, old_prefix: &str, new_prefix: &str) -> MessageDelta {
        let mut delta = MessageDelta::default();
        for message in &mut self.messages {
            if message.targets_within(old_prefix) {
                delta.removed.push(message.clone());
                message.target = format!("{}{}", new_prefix, &message.target[old_prefix.len()..]);
                delta.added.push(message.clone());
            }
        }
        delta
    }

    pub fn clear(&mut self) -> MessageDelta {
        MessageDelta {
            added: Vec::new(),
            removed: std::mem::take(&mut self.messages),
        }
    }
}

/// Resolves a message target relative to the resource of a request
pub fn resolve_target(resource: &str, target: Option<&str>) -> String {
    match target {
        None | Some("") => resource.to_string(),
        Some(target) if target.starts_with('/') => target.to_string(),
        Some(target) if target.starts_with('(') => format!("{}{}", resource, target),
        Some(target) => format!("{}/{}", resource.trim_end_matches('/'), target),
    }
}

fn parse_message(raw: &Value, resource: &str) -> Option<Message> {
    let object = raw.as_object()?;
    let text = object.get("message").and_then(Value::as_str)?;
    let severity = object
        .get("numericSeverity")
        .and_then(Value::as_u64)
        .map(MessageType::from_numeric_severity)
        .unwrap_or(MessageType::None);
    let target = resolve_target(resource, object.get("target").and_then(Value::as_str));
    let mut message = Message::new(text, target, severity);
    if let Some(code) = object.get("code").and_then(Value::as_str) {
        message = message.with_code(code);
    }
    if object.get("transition").and_then(Value::as_bool).unwrap_or(false) {
        message = message.persistent();
    }
    Some(message)
}

fn parse_messages(raw: &Value, resource: &str) -> Vec<Message> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| parse_message(item, resource))
                .collect()
        })
        .unwrap_or_default()
}

/// Messages from the `sap-messages` header; an unparseable header is logged and ignored
pub fn messages_from_header(response: &Response, resource: &str) -> Vec<Message> {
    let Some(header) = response.header(HEADER_SAP_MESSAGES) else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(header) {
        Ok(raw) => parse_messages(&raw, resource),
        Err(e) => {
            warn!("Ignoring malformed {} header: {}", HEADER_SAP_MESSAGES, e);
            Vec::new()
        }
    }
}

/// Messages embedded in an entity's messages property; `None` if the entity
/// does not carry the property
pub fn messages_from_entity(entity: &Map<String, Value>, property: &str, entity_path: &str) -> Option<Vec<Message>> {
    entity.get(property).map(|raw| parse_messages(raw, entity_path))
}

/// Messages reported for a failed request
pub fn messages_from_error(error: &ODataError, resource: &str) -> Vec<Message> {
    match error {
        ODataError::Canceled { .. } => Vec::new(),
        ODataError::Skipped { .. } => {
            vec![Message::new(SKIPPED_MESSAGE, "", MessageType::Error).technical()]
        }
        ODataError::Domain {
            code,
            message,
            target,
            details,
            ..
        } => {
            let mut messages = vec![
                Message::new(message.clone(), resolve_target(resource, target.as_deref()), MessageType::Error)
                    .with_code(code.clone())
                    .technical(),
            ];
            messages.extend(details.iter().map(|detail| {
                Message::new(
                    detail.message.clone(),
                    resolve_target(resource, detail.target.as_deref()),
                    MessageType::Error,
                )
                .with_code(detail.code.clone())
                .technical()
            }));
            messages
        }
        other => vec![Message::new(other.to_string(), "", MessageType::Error).technical()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(target: &str, persistent: bool) -> Message {
        let message = Message::new(format!("text for {}", target), target, MessageType::Warning);
        if persistent { message.persistent() } else { message }
    }

    #[test]
    fn test_replace_drops_stale_and_keeps_siblings() {
        let mut store = MessageStore::new();
        store.add(vec![
            message("/SalesOrderList('1')/Note", false),
            message("/SalesOrderList('2')/Note", false),
            message("/SalesOrderList('1')/GrossAmount", true),
        ]);

        let delta = store.replace("/SalesOrderList('1')", &[], Vec::new());

        assert_eq!(delta.removed, vec![message("/SalesOrderList('1')/Note", false)]);
        assert_eq!(store.len(), 2);
        assert!(store.all().contains(&message("/SalesOrderList('2')/Note", false)));
        assert!(store.all().contains(&message("/SalesOrderList('1')/GrossAmount", true)));
    }

    #[test]
    fn test_replace_is_not_accumulating() {
        let mut store = MessageStore::new();
        store.replace("/SalesOrderList('1')", &[], vec![message("/SalesOrderList('1')/Note", false)]);
        let delta = store.replace("/SalesOrderList('1')", &[], vec![message("/SalesOrderList('1')/Note", false)]);
        assert!(delta.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_keeps_messages_of_excluded_caches() {
        let mut store = MessageStore::new();
        store.add(vec![
            message("/SalesOrderList('1')/Note", false),
            message("/SalesOrderList('1')/SO_2_SOITEM('10')/Quantity", false),
        ]);

        let delta = store.replace(
            "/SalesOrderList('1')",
            &["/SalesOrderList('1')/SO_2_SOITEM".to_string()],
            Vec::new(),
        );

        assert_eq!(delta.removed, vec![message("/SalesOrderList('1')/Note", false)]);
        assert_eq!(store.all(), &[message("/SalesOrderList('1')/SO_2_SOITEM('10')/Quantity", false)]);
    }

    #[test]
    fn test_entity_without_messages_property() {
        let entity = json!({"SalesOrderID": "1"});
        let entity = entity.as_object().unwrap();
        assert!(messages_from_entity(entity, "Messages", "/SalesOrderList('1')").is_none());

        let entity = json!({"SalesOrderID": "1", "Messages": []});
        let entity = entity.as_object().unwrap();
        assert_eq!(messages_from_entity(entity, "Messages", "/SalesOrderList('1')"), Some(Vec::new()));
    }

    #[test]
    fn test_rename_and_remove_within() {
        let mut store = MessageStore::new();
        store.add(vec![message("/SalesOrderList($uid=id-1)/Note", true)]);
        store.rename("/SalesOrderList($uid=id-1)", "/SalesOrderList('43')");
        assert_eq!(store.all()[0].target, "/SalesOrderList('43')/Note");

        let delta = store.remove_within("/SalesOrderList('43')");
        assert_eq!(delta.removed.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_header_messages() {
        let response = Response::ok(json!({})).with_header(
            "sap-messages",
            json!([
                {"code": "C1", "message": "Enter a note", "target": "Note", "numericSeverity": 3},
                {"code": "C2", "message": "Saved", "target": "", "numericSeverity": 1, "transition": true}
            ])
            .to_string(),
        );
        let messages = messages_from_header(&response, "/SalesOrderList('42')");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].target, "/SalesOrderList('42')/Note");
        assert_eq!(messages[0].message_type, MessageType::Warning);
        assert!(!messages[0].persistent);
        assert_eq!(messages[1].target, "/SalesOrderList('42')");
        assert!(messages[1].persistent);

        let broken = Response::ok(json!({})).with_header("sap-messages", "not json");
        assert!(messages_from_header(&broken, "/X").is_empty());
    }

    #[test]
    fn test_error_messages() {
        let error = ODataError::Domain {
            status: 400,
            code: "CODE".to_string(),
            message: "Value -1 not allowed".to_string(),
            target: Some("Quantity".to_string()),
            details: Vec::new(),
        };
        let messages = messages_from_error(&error, "/SalesOrderList('42')/SO_2_SOITEM('10')");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].target, "/SalesOrderList('42')/SO_2_SOITEM('10')/Quantity");
        assert!(messages[0].persistent && messages[0].technical);

        let skipped = messages_from_error(&ODataError::skipped(error), "/X");
        assert_eq!(skipped[0].text, SKIPPED_MESSAGE);
        assert!(messages_from_error(&ODataError::canceled("reset"), "/X").is_empty());
    }
}
