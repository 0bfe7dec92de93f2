// packages/runify/src/protocol.rs
//! Bootstrap protocol spoken between the host and an Injected Runtime
//!
//! Requests flow host → runtime, events flow runtime → host. Both are JSON
//! objects tagged by `type`. Process runtimes exchange them as single lines
//! prefixed with [`FRAME_PREFIX`]; the browser runtime posts events to the
//! Transport Channel; the in-process engine thread uses the Rust values
//! directly.
//!
//! # Version 1
//!
//! ```text
//! host    → runtime   eval | createRealm | getGlobal | setGlobal | destroyRealm
//! runtime → host      ready | print | completion | result | failure
//!                     | realmDestroyed | destroy
//! ```

use crate::completion::{CompletionKind, RawError};
use crate::realm::RealmId;
use crate::utils::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};

/// Protocol revision embedded in every bootstrap
pub const PROTOCOL_VERSION: u32 = 1;

/// Line prefix marking a protocol frame on a process's stdout or stdin
pub const FRAME_PREFIX: &str = "#!runify ";

/// Host → runtime request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Eval {
        seq: u64,
        realm: RealmId,
        code: String,
        #[serde(rename = "async")]
        is_async: bool,
    },

    #[serde(rename_all = "camelCase")]
    CreateRealm {
        seq: u64,
        realm: RealmId,
        parent: RealmId,
        globals: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename_all = "camelCase")]
    GetGlobal {
        seq: u64,
        realm: RealmId,
        name: String,
    },

    #[serde(rename_all = "camelCase")]
    SetGlobal {
        seq: u64,
        realm: RealmId,
        name: String,
        value: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    DestroyRealm { seq: u64, realm: RealmId },
}

impl Request {
    pub fn seq(&self) -> u64 {
        match self {
            Request::Eval { seq, .. }
            | Request::CreateRealm { seq, .. }
            | Request::GetGlobal { seq, .. }
            | Request::SetGlobal { seq, .. }
            | Request::DestroyRealm { seq, .. } => *seq,
        }
    }

    /// Short operation name for logs
    pub fn op(&self) -> &'static str {
        match self {
            Request::Eval { .. } => "eval",
            Request::CreateRealm { .. } => "createRealm",
            Request::GetGlobal { .. } => "getGlobal",
            Request::SetGlobal { .. } => "setGlobal",
            Request::DestroyRealm { .. } => "destroyRealm",
        }
    }

    /// Encode as one stdin line for a process runtime
    pub fn to_frame(&self) -> Result<String> {
        Ok(format!("{}{}\n", FRAME_PREFIX, serde_json::to_string(self)?))
    }
}

/// Runtime → host event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    /// Handshake sent once the bootstrap is installed
    Ready {
        protocol: u32,
        #[serde(default)]
        engine: Option<String>,
    },

    /// Output of one `print` call; `seq` is absent for untagged output
    Print {
        #[serde(default)]
        seq: Option<u64>,
        text: String,
    },

    /// Outcome of an `eval` request
    Completion {
        seq: u64,
        kind: CompletionKind,
        #[serde(default)]
        error: Option<RawError>,
    },

    /// Successful answer to a non-eval request
    Result {
        seq: u64,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },

    /// A non-eval request could not be carried out
    Failure { seq: u64, message: String },

    /// A host-known realm was torn down from inside the engine
    RealmDestroyed { realm: RealmId },

    /// The root realm signalled session teardown or async completion
    Destroy {},

    /// Synthesized by a supervisor when its backend goes away
    #[serde(skip)]
    Disconnected { reason: String },
}

impl RuntimeEvent {
    /// Parse one stdout line of a process runtime
    ///
    /// Lines without the frame prefix are engine output that bypassed the
    /// bootstrap (`console.log` and friends) and count as untagged prints.
    pub fn from_line(line: &str) -> Result<RuntimeEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        match line.strip_prefix(FRAME_PREFIX) {
            Some(body) => serde_json::from_str(body).map_err(|e| {
                HarnessError::Protocol(format!("malformed frame {:?}: {}", body, e))
            }),
            None => Ok(RuntimeEvent::Print {
                seq: None,
                text: line.to_string(),
            }),
        }
    }

    /// Parse an event posted to the Transport Channel
    pub fn from_json(body: &[u8]) -> Result<RuntimeEvent> {
        serde_json::from_slice(body)
            .map_err(|e| HarnessError::Protocol(format!("malformed event body: {}", e)))
    }

    /// Check a handshake against the host's protocol version
    pub fn check_ready(&self) -> Result<()> {
        match self {
            RuntimeEvent::Ready { protocol, .. } if *protocol == PROTOCOL_VERSION => Ok(()),
            RuntimeEvent::Ready { protocol, .. } => Err(HarnessError::Protocol(format!(
                "runtime speaks protocol {}, host speaks {}",
                protocol, PROTOCOL_VERSION
            ))),
            other => Err(HarnessError::Protocol(format!(
                "expected ready handshake, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::Eval {
            seq: 7,
            realm: RealmId::ROOT,
            code: "print(1)".into(),
            is_async: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"type": "eval", "seq": 7, "realm": 0, "code": "print(1)", "async": true})
        );

        let frame = request.to_frame().unwrap();
        assert!(frame.starts_with(FRAME_PREFIX));
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }

    #[test]
    fn test_code_with_newlines_stays_on_one_line() {
        let request = Request::Eval {
            seq: 1,
            realm: RealmId::ROOT,
            code: "var x = 1;\nprint(x);\n".into(),
            is_async: false,
        };
        assert_eq!(request.to_frame().unwrap().matches('\n').count(), 1);
    }

    #[test]
    fn test_parse_completion_frame() {
        let line = r#"#!runify {"type":"completion","seq":3,"kind":"throw","error":{"name":"TypeError","message":"m","stack":"TypeError: m\n    at eval.js:1:7"}}"#;
        match RuntimeEvent::from_line(line).unwrap() {
            RuntimeEvent::Completion { seq, kind, error } => {
                assert_eq!(seq, 3);
                assert_eq!(kind, CompletionKind::Throw);
                assert_eq!(error.unwrap().name.as_deref(), Some("TypeError"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unframed_line_is_print() {
        let event = RuntimeEvent::from_line("hello from console.log\r\n").unwrap();
        assert_eq!(
            event,
            RuntimeEvent::Print {
                seq: None,
                text: "hello from console.log".into()
            }
        );
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = RuntimeEvent::from_line("#!runify {not json").unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }

    #[test]
    fn test_destroy_and_realm_events() {
        assert_eq!(
            RuntimeEvent::from_json(br#"{"type":"destroy"}"#).unwrap(),
            RuntimeEvent::Destroy {}
        );
        assert_eq!(
            RuntimeEvent::from_json(br#"{"type":"realmDestroyed","realm":4}"#).unwrap(),
            RuntimeEvent::RealmDestroyed {
                realm: RealmId::from_raw(4)
            }
        );
    }

    #[test]
    fn test_ready_version_check() {
        let ok = RuntimeEvent::Ready {
            protocol: PROTOCOL_VERSION,
            engine: Some("node".into()),
        };
        assert!(ok.check_ready().is_ok());

        let stale = RuntimeEvent::Ready {
            protocol: PROTOCOL_VERSION + 1,
            engine: None,
        };
        assert!(matches!(stale.check_ready(), Err(HarnessError::Protocol(_))));

        let wrong = RuntimeEvent::Destroy {};
        assert!(wrong.check_ready().is_err());
    }
}
