//! Relay wire protocol: filters and the JSON-array frames exchanged with relays.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::constants::{HEX32_LEN, TAG_PUBKEY};
use crate::error::{FilterError, MessageError};
use crate::event::SignedEvent;
use crate::types::PublicKey;

/// A predicate over events, sent to relays inside `REQ`.
///
/// Empty sets leave that field unconstrained. Tag filters are keyed by a
/// single letter and serialized as `"#<letter>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: BTreeSet<String>,
    pub authors: BTreeSet<String>,
    pub kinds: BTreeSet<u16>,
    pub tags: BTreeMap<char, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.insert(id.into());
        self
    }

    pub fn author(mut self, author: &PublicKey) -> Self {
        self.authors.insert(author.to_hex());
        self
    }

    pub fn authors<'a>(mut self, authors: impl IntoIterator<Item = &'a PublicKey>) -> Self {
        self.authors.extend(authors.into_iter().map(PublicKey::to_hex));
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn tag(mut self, name: char, value: impl Into<String>) -> Self {
        self.tags.entry(name).or_default().insert(value.into());
        self
    }

    /// Events addressing `pubkey` via a `p` tag
    pub fn pubkey(self, pubkey: &PublicKey) -> Self {
        self.tag('p', pubkey.to_hex())
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject filters no relay should be asked to evaluate.
    pub fn validate(&self) -> Result<(), FilterError> {
        let unconstrained = self.ids.is_empty()
            && self.authors.is_empty()
            && self.kinds.is_empty()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none();
        if unconstrained {
            return Err(FilterError::Unconstrained);
        }

        for id in &self.ids {
            check_hex32("id", id)?;
        }
        for author in &self.authors {
            check_hex32("author", author)?;
        }

        for (name, values) in &self.tags {
            if !name.is_ascii_alphabetic() {
                return Err(FilterError::InvalidTagName(*name));
            }
            if values.is_empty() {
                return Err(FilterError::EmptyTagValues(*name));
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(FilterError::InvertedRange { since, until });
            }
        }

        if self.limit == Some(0) {
            return Err(FilterError::ZeroLimit);
        }

        Ok(())
    }

    /// Evaluate the filter locally. `limit` only applies relay-side.
    pub fn matches(&self, event: &SignedEvent) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey.to_hex()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(name, values)| {
            let name = name.to_string();
            let found = event.tag_values(&name).any(|value| values.contains(value));
            found
        })
    }
}

fn check_hex32(field: &'static str, value: &str) -> Result<(), FilterError> {
    let valid = value.len() == HEX32_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(FilterError::InvalidHex {
            field,
            value: value.to_string(),
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if !self.ids.is_empty() {
            map.serialize_entry("ids", &self.ids)?;
        }
        if !self.authors.is_empty() {
            map.serialize_entry("authors", &self.authors)?;
        }
        if !self.kinds.is_empty() {
            map.serialize_entry("kinds", &self.kinds)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        let mut filter = Filter::new();

        for (key, value) in object {
            match key.as_str() {
                "ids" => filter.ids = serde_json::from_value(value).map_err(D::Error::custom)?,
                "authors" => {
                    filter.authors = serde_json::from_value(value).map_err(D::Error::custom)?
                }
                "kinds" => filter.kinds = serde_json::from_value(value).map_err(D::Error::custom)?,
                "since" => filter.since = serde_json::from_value(value).map_err(D::Error::custom)?,
                "until" => filter.until = serde_json::from_value(value).map_err(D::Error::custom)?,
                "limit" => filter.limit = serde_json::from_value(value).map_err(D::Error::custom)?,
                tag if tag.starts_with('#') && tag.chars().count() == 2 => {
                    let name = tag.chars().nth(1).unwrap_or('#');
                    let values: BTreeSet<String> =
                        serde_json::from_value(value).map_err(D::Error::custom)?;
                    filter.tags.insert(name, values);
                }
                // unknown keys are ignored, as relays do
                _ => {}
            }
        }

        Ok(filter)
    }
}

/// Frames sent from client to relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(SignedEvent),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = parse_frame(json)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let event = frame.get(1).ok_or(MessageError::MissingField("event"))?;
                Ok(ClientMessage::Event(serde_json::from_value(event.clone())?))
            }
            "REQ" => {
                let subscription_id = string_at(&frame, 1, "subscription_id")?;
                let filters = frame[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Frames sent from relay to client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: SignedEvent,
    },

    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },

    /// `["AUTH", <challenge>]`
    Auth { challenge: String },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = parse_frame(json)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1, "subscription_id")?;
                let event = frame.get(2).ok_or(MessageError::MissingField("event"))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: serde_json::from_value(event.clone())?,
                })
            }
            "OK" => {
                let event_id = string_at(&frame, 1, "event_id")?;
                let accepted = frame
                    .get(2)
                    .ok_or(MessageError::MissingField("accepted"))?
                    .as_bool()
                    .ok_or_else(|| MessageError::InvalidFormat("accepted not a boolean".into()))?;
                let message = optional_string_at(&frame, 3);
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
                message: optional_string_at(&frame, 2),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&frame, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&frame, 1, "challenge")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => serde_json::json!(["AUTH", challenge]),
        };
        Ok(value.to_string())
    }
}

fn parse_frame(json: &str) -> Result<Vec<Value>, MessageError> {
    let frame: Vec<Value> =
        serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
    if frame.is_empty() {
        return Err(MessageError::InvalidFormat("empty array".into()));
    }
    Ok(frame)
}

fn frame_type(frame: &[Value]) -> Result<&str, MessageError> {
    frame[0]
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".into()))
}

fn string_at(frame: &[Value], index: usize, field: &'static str) -> Result<String, MessageError> {
    frame
        .get(index)
        .ok_or(MessageError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{field} not a string")))
}

fn optional_string_at(frame: &[Value], index: usize) -> String {
    frame
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The `p`-tag value identifying who an event is addressed to
pub fn addressed_party(event: &SignedEvent) -> Option<PublicKey> {
    event
        .first_tag_value(TAG_PUBKEY)
        .and_then(|value| PublicKey::from_hex(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;
    use crate::identity::{Identity, Signer};

    fn event_to(author: &Identity, recipient: &PublicKey, kind: u16, created_at: u64) -> SignedEvent {
        UnsignedEvent {
            pubkey: author.public_key(),
            created_at,
            kind,
            tags: vec![vec!["p".to_string(), recipient.to_hex()]],
            content: "payload".to_string(),
        }
        .sign(author)
        .unwrap()
    }

    #[test]
    fn test_filter_serializes_tag_keys() {
        let me = PublicKey([0xaa; 32]);
        let filter = Filter::new().kind(4).author(&me).pubkey(&me).limit(10);
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["kinds"], serde_json::json!([4]));
        assert_eq!(json["authors"], serde_json::json!([me.to_hex()]));
        assert_eq!(json["#p"], serde_json::json!([me.to_hex()]));
        assert_eq!(json["limit"], 10);
        assert!(json.get("ids").is_none());
        assert!(json.get("since").is_none());
    }

    #[test]
    fn test_filter_deserializes_from_wire() {
        let json = r##"{"kinds":[4],"#p":["abc"],"since":10,"search":"ignored"}"##;
        let filter: Filter = serde_json::from_str(json).unwrap();
        assert_eq!(filter, Filter::new().kind(4).tag('p', "abc").since(10));
    }

    #[test]
    fn test_filter_validation() {
        let key = PublicKey([0x01; 32]);
        assert_eq!(Filter::new().validate(), Err(FilterError::Unconstrained));
        assert_eq!(Filter::new().limit(5).validate(), Err(FilterError::Unconstrained));
        assert!(Filter::new().kind(4).pubkey(&key).validate().is_ok());

        assert!(matches!(
            Filter::new().id("xyz").validate(),
            Err(FilterError::InvalidHex { field: "id", .. })
        ));
        assert!(matches!(
            Filter::new().kind(4).id("AB".repeat(32)).validate(),
            Err(FilterError::InvalidHex { .. })
        ));
        assert_eq!(
            Filter::new().tag('1', "x").validate(),
            Err(FilterError::InvalidTagName('1'))
        );

        let mut empty_tag = Filter::new().kind(4);
        empty_tag.tags.insert('p', BTreeSet::new());
        assert_eq!(empty_tag.validate(), Err(FilterError::EmptyTagValues('p')));

        assert_eq!(
            Filter::new().since(10).until(5).validate(),
            Err(FilterError::InvertedRange { since: 10, until: 5 })
        );
        assert_eq!(Filter::new().kind(4).limit(0).validate(), Err(FilterError::ZeroLimit));
    }

    #[test]
    fn test_filter_matching() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let event = event_to(&alice, &bob.public_key(), 4, 100);

        assert!(Filter::new().kind(4).matches(&event));
        assert!(Filter::new().author(&alice.public_key()).matches(&event));
        assert!(Filter::new().pubkey(&bob.public_key()).matches(&event));
        assert!(Filter::new().id(event.id.clone()).matches(&event));
        assert!(Filter::new().since(100).until(100).matches(&event));

        assert!(!Filter::new().kind(1).matches(&event));
        assert!(!Filter::new().author(&bob.public_key()).matches(&event));
        assert!(!Filter::new().pubkey(&alice.public_key()).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(!Filter::new().until(99).matches(&event));
        assert!(!Filter::new().kind(4).tag('e', "x").matches(&event));
    }

    #[test]
    fn test_client_message_json() {
        let filter = Filter::new().kind(4);
        let req = ClientMessage::Req {
            subscription_id: "sub1".into(),
            filters: vec![filter.clone()],
        };
        assert_eq!(req.to_json().unwrap(), r#"["REQ","sub1",{"kinds":[4]}]"#);
        assert_eq!(ClientMessage::from_json(&req.to_json().unwrap()).unwrap(), req);

        let close = ClientMessage::Close {
            subscription_id: "sub1".into(),
        };
        assert_eq!(close.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_relay_message_parsing() {
        let alice = Identity::generate();
        let event = event_to(&alice, &alice.public_key(), 4, 1);
        let frame = serde_json::json!(["EVENT", "sub1", event]).to_string();
        match RelayMessage::from_json(&frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(parsed, event);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            RelayMessage::from_json(r#"["OK","abc",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: false,
                message: "blocked: spam".into()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "sub1".into()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub1"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "sub1".into(),
                message: String::new()
            }
        );
        assert!(matches!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#).unwrap(),
            RelayMessage::Auth { .. }
        ));
    }

    #[test]
    fn test_relay_message_errors() {
        assert!(matches!(
            RelayMessage::from_json("not json"),
            Err(MessageError::InvalidFormat(_))
        ));
        assert!(matches!(
            RelayMessage::from_json("[]"),
            Err(MessageError::InvalidFormat(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["COUNT","x",{"count":1}]"#),
            Err(MessageError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(MessageError::MissingField("subscription_id"))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["OK","abc","yes",""]"#),
            Err(MessageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_addressed_party() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let event = event_to(&alice, &bob.public_key(), 4, 1);
        assert_eq!(addressed_party(&event), Some(bob.public_key()));
    }
}
