use crate::errors::{GatewayError, Result};
use lazy_static::lazy_static;
use redis::aio::ConnectionLike;
use redis::Script;
use tracing::{debug, info};

lazy_static! {
    static ref WINDOW_SCRIPT: Script = Script::new(include_str!("../../scripts/window_counter.lua"));
    static ref BUCKET_SCRIPT: Script = Script::new(include_str!("../../scripts/token_bucket.lua"));
}

/// Register both Lua scripts with Redis so the first EVALSHA hits
pub async fn load_scripts<C: ConnectionLike>(conn: &mut C) -> Result<()> {
    debug!("Loading Lua scripts into Redis...");

    for (name, script) in [("window_counter", &*WINDOW_SCRIPT), ("token_bucket", &*BUCKET_SCRIPT)] {
        let sha: String = script
            .prepare_invoke()
            .load_async(&mut *conn)
            .await
            .map_err(|e| {
                GatewayError::StoreConnection(format!("Failed to load Lua script {}: {}", name, e))
            })?;
        info!("Lua script {} loaded (SHA: {})", name, sha);
    }

    Ok(())
}

pub fn window_script() -> &'static Script {
    &WINDOW_SCRIPT
}

pub fn bucket_script() -> &'static Script {
    &BUCKET_SCRIPT
}
