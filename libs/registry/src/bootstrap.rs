//! Namespace bootstrapping: make sure a persistent path exists.

use config::AclPolicy;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::path;
use crate::session::Session;

/// Ensure `target` exists as a persistent node, creating missing ancestors.
///
/// Idempotent and race-safe: another client creating the same node between
/// the existence check and the create counts as success.
pub async fn ensure_path(session: &Session, target: &str, acl: AclPolicy) -> RegistryResult<()> {
    path::validate_path(target)?;
    if session.exists(target).await.map_err(|e| wrap(target, e))? {
        return Ok(());
    }

    for node in path::ancestors(target) {
        match session.create_persistent(&node, acl).await {
            Ok(_) => debug!(path = %node, %acl, "created namespace node"),
            Err(RegistryError::NodeExists(_)) => {}
            Err(err) => return Err(wrap(&node, err)),
        }
    }
    Ok(())
}

fn wrap(path: &str, err: RegistryError) -> RegistryError {
    if err.is_terminal() {
        return err;
    }
    RegistryError::Bootstrap {
        path: path.to_owned(),
        reason: err.to_string(),
    }
}
