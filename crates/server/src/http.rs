// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;

use axum::{Router, extract::DefaultBodyLimit};
use lanxfer_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{BindSnafu, ParseAddressSnafu, Result, ServiceHandler};

/// Upper bound on request bodies unless the caller picks its own.
pub const DEFAULT_MAX_HTTP_BODY_SIZE: ReadableSize = ReadableSize::mb(2);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
pub struct RestServerConfig {
    /// `host:port` to listen on. Port 0 picks a free port.
    #[default = "0.0.0.0:8765"]
    pub bind_address:  String,
    #[default(_code = "DEFAULT_MAX_HTTP_BODY_SIZE")]
    #[builder(default = DEFAULT_MAX_HTTP_BODY_SIZE)]
    pub max_body_size: ReadableSize,
}

/// Binds the listener, then spawns the server task.
///
/// Binding happens before returning so that an occupied port surfaces as an
/// error here instead of inside the background task. Handlers receive the
/// peer address through `ConnectInfo<SocketAddr>`.
///
/// ```rust,ignore
/// use axum::{Router, routing::get};
/// use lanxfer_server::http::{RestServerConfig, start_rest_server};
///
/// fn my_routes(router: Router) -> Router {
///     router.route("/hello", get(|| async { "hello" }))
/// }
///
/// let handle = start_rest_server(RestServerConfig::default(), vec![my_routes]).await?;
/// ```
pub async fn start_rest_server<F>(
    config: RestServerConfig,
    route_handlers: Vec<F>,
) -> Result<ServiceHandler>
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    let bind_addr = config
        .bind_address
        .parse::<SocketAddr>()
        .context(ParseAddressSnafu {
            addr: config.bind_address.clone(),
        })?;

    let mut router = Router::new();
    for handler in &route_handlers {
        router = handler(router);
    }
    let router = router
        .layer(DefaultBodyLimit::max(config.max_body_size.as_usize()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context(BindSnafu {
            addr: config.bind_address.clone(),
        })?;
    let local_addr = listener.local_addr().context(BindSnafu {
        addr: config.bind_address.clone(),
    })?;

    let cancellation_token = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let token = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = started_tx.send(());
            info!("REST server (on {}) started", local_addr);
            token.cancelled().await;
            info!("REST server (on {}) received shutdown signal", local_addr);
        })
        .await;

        info!("REST server (on {}) task completed: {:?}", local_addr, result);
    });

    Ok(ServiceHandler {
        join_handle,
        cancellation_token,
        started_rx: Some(started_rx),
        local_addr,
    })
}
