//! Test fixtures and canned test documents

use serde_json::{json, Value};

pub struct TestFixtures;

impl TestFixtures {
    pub const CONNECTION_STRING: &'static str = "backend://localhost:27017/conformance";
    pub const DATABASE_NAME: &'static str = "conformance";
    pub const PRIMARY_ADDRESS: &'static str = "localhost:27017";
    pub const SERVER_VERSION: &'static str = "7.0.2";

    pub fn create_client(id: &str) -> Value {
        json!({"name": "createEntity", "arguments": {"kind": "client", "id": id}})
    }

    pub fn create_observer(id: &str, client: &str) -> Value {
        json!({
            "name": "createEntity",
            "arguments": {
                "kind": "observer",
                "id": id,
                "client": client,
                "observeEvents": ["commandStartedEvent", "commandSucceededEvent", "commandFailedEvent"]
            }
        })
    }

    pub fn create_session(id: &str, client: &str) -> Value {
        json!({"name": "createEntity", "arguments": {"kind": "session", "id": id, "client": client}})
    }

    pub fn ping(client: &str) -> Value {
        json!({
            "name": "runCommand",
            "arguments": {"client": client, "command": {"ping": 1}, "commandName": "ping"}
        })
    }

    pub fn ping_in_session(client: &str, session: &str) -> Value {
        json!({
            "name": "runCommand",
            "arguments": {"client": client, "session": session, "command": {"ping": 1}}
        })
    }

    pub fn assert_event_count(observer: &str, command_name: &str, count: usize) -> Value {
        json!({
            "name": "assertEventCount",
            "arguments": {
                "client": observer,
                "event": {"commandStartedEvent": {"commandName": command_name}},
                "count": count
            }
        })
    }

    /// Observer on a fresh client, three pings, then an exact count
    pub fn three_pings_counted(expected_count: usize) -> Value {
        json!({
            "description": "three pings are observed",
            "operations": [
                Self::create_client("client0"),
                Self::create_observer("ev0", "client0"),
                Self::ping("client0"),
                Self::ping("client0"),
                Self::ping("client0"),
                Self::assert_event_count("ev0", "ping", expected_count),
            ]
        })
    }

    /// Refers to a session that was never created
    pub fn unknown_session_reference() -> Value {
        json!({
            "description": "session must exist before use",
            "operations": [
                Self::create_client("client0"),
                Self::ping_in_session("client0", "session1"),
                Self::ping("client0"),
            ]
        })
    }

    /// A failing command, optionally expected to fail
    pub fn failing_command(expect_error: bool) -> Value {
        let mut step = json!({
            "name": "runCommand",
            "arguments": {"command": {"insert": "coll", "documents": [{"_id": 1}]}}
        });
        if expect_error {
            step["expectedError"] = json!({
                "isError": true,
                "errorCode": 11000,
                "errorCodeName": "DuplicateKey",
                "errorContains": "duplicate key"
            });
        }
        json!({
            "description": "duplicate key insert",
            "operations": [step]
        })
    }

    pub fn duplicate_key_message() -> &'static str {
        "E11000 Duplicate Key error collection: conformance.coll"
    }
}
