//! Queued control-plane actions.
//!
//! The `actions` request returns an ordered list of raw envelopes. Each is
//! decoded twice: once for the `{id, type, container}` header, then again
//! with the kind-specific shape once `type` is known. Unknown kinds are
//! typed errors; the dispatcher logs them and moves on to the next entry.

use anyhow::Result;
use bollard::Docker;
use serde::Deserialize;

use crate::container::Container;
use crate::errors::SupervisorError;
use crate::user;

pub const MANAGEMENT: &str = "management";
pub const POWER: &str = "power";
pub const PASSWORD: &str = "password";

/// Common header of every action envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub container: Container,
}

#[derive(Debug, Deserialize)]
struct ManagementAction {
    #[serde(default)]
    action: String,
}

#[derive(Debug, Deserialize)]
struct PowerAction {
    #[serde(default)]
    power: String,
}

/// A message the dispatcher must send on the container's action path after
/// the action completed.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub action: String,
    pub params: serde_json::Value,
}

/// Executes one action and returns its follow-up message, if any.
///
/// `envelope` is the decoded header; `raw` is the original envelope for
/// the kind-specific re-decode.
pub async fn process(
    envelope: &ActionEnvelope,
    raw: &serde_json::Value,
    docker: &Docker,
) -> Result<Option<FollowUp>> {
    match envelope.kind.as_str() {
        MANAGEMENT => {
            let management: ManagementAction = serde_json::from_value(raw.clone())?;
            process_management(envelope, &management.action, docker).await?;
            Ok(None)
        }
        POWER => {
            let power: PowerAction = serde_json::from_value(raw.clone())?;
            process_power(envelope, &power.power, docker).await?;
            Ok(None)
        }
        PASSWORD => {
            let password = user::reset_password(&envelope.container.id).await?;
            Ok(Some(FollowUp {
                action: PASSWORD.to_string(),
                params: serde_json::json!({ "password": password }),
            }))
        }
        _ => Err(SupervisorError::InvalidActionType.into()),
    }
}

async fn process_management(
    envelope: &ActionEnvelope,
    action: &str,
    docker: &Docker,
) -> Result<()> {
    let container = &envelope.container;
    match action {
        "create" => {
            let mut container = container.clone();
            container.expecting_first_commit = container.branch.is_some();
            container.create(docker).await
        }
        "update" => container.update(docker).await,
        "delete" => container.destroy(docker).await,
        _ => Err(SupervisorError::InvalidManagementAction.into()),
    }
}

async fn process_power(envelope: &ActionEnvelope, power: &str, docker: &Docker) -> Result<()> {
    let container = &envelope.container;
    match power {
        "start" => container.start(docker).await,
        "stop" => container.stop(docker).await,
        "restart" => container.restart(docker).await,
        "pause" => container.pause(docker).await,
        "unpause" => container.unpause(docker).await,
        "kill" => container.kill(docker).await,
        _ => Err(SupervisorError::InvalidPowerAction.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker() -> Docker {
        // Lazy client; nothing connects until a call is made.
        Docker::connect_with_local_defaults().unwrap()
    }

    // =========================================================================
    // Envelope decoding
    // =========================================================================

    #[test]
    fn test_header_decode() {
        let envelope: ActionEnvelope = serde_json::from_str(
            r#"{"id":"a1","type":"power","container":{"id":"x"},"power":"restart"}"#,
        )
        .unwrap();
        assert_eq!(envelope.id, "a1");
        assert_eq!(envelope.kind, "power");
        assert_eq!(envelope.container.id, "x");
    }

    #[test]
    fn test_management_redecode() {
        let raw = serde_json::json!({
            "id": "a2",
            "type": "management",
            "action": "create",
            "container": {"id": "x", "image": "nginx"},
        });
        let management: ManagementAction = serde_json::from_value(raw).unwrap();
        assert_eq!(management.action, "create");
    }

    #[test]
    fn test_power_redecode() {
        let raw = serde_json::json!({
            "id": "a3",
            "type": "power",
            "power": "kill",
            "container": {"id": "x"},
        });
        let power: PowerAction = serde_json::from_value(raw).unwrap();
        assert_eq!(power.power, "kill");
    }

    #[test]
    fn test_header_without_container_is_rejected() {
        let result: std::result::Result<ActionEnvelope, _> =
            serde_json::from_str(r#"{"id":"a4","type":"power"}"#);
        assert!(result.is_err());
    }

    // =========================================================================
    // Dispatch errors
    // =========================================================================

    #[tokio::test]
    async fn test_unknown_kind_is_typed_error() {
        let raw = serde_json::json!({"id":"a5","type":"mystery","container":{"id":"x"}});
        let envelope: ActionEnvelope = serde_json::from_value(raw.clone()).unwrap();
        let err = process(&envelope, &raw, &docker()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::InvalidActionType)
        ));
    }

    #[tokio::test]
    async fn test_unknown_power_subaction_is_typed_error() {
        let raw = serde_json::json!({"id":"a6","type":"power","power":"warp","container":{"id":"x"}});
        let envelope: ActionEnvelope = serde_json::from_value(raw.clone()).unwrap();
        let err = process(&envelope, &raw, &docker()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::InvalidPowerAction)
        ));
    }

    #[tokio::test]
    async fn test_unknown_management_subaction_is_typed_error() {
        let raw = serde_json::json!({"id":"a7","type":"management","action":"tickle","container":{"id":"x"}});
        let envelope: ActionEnvelope = serde_json::from_value(raw.clone()).unwrap();
        let err = process(&envelope, &raw, &docker()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::InvalidManagementAction)
        ));
    }
}
