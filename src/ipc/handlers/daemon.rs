use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn ping(_params: Value, _ctx: &AppContext) -> Result<Value> {
    Ok(json!({ "pong": true }))
}

pub async fn status(_params: Value, ctx: &AppContext) -> Result<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let paired_nodes = ctx.storage.count_nodes().await?;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gatewayId": ctx.gateway_id,
        "uptime": uptime,
        "pairedNodes": paired_nodes,
        "connectedClients": ctx.broadcaster.subscribers(),
        "port": ctx.config.port
    }))
}
