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

//! HTTP surface of the receiver.
//!
//! Handlers read the request, then hand it to the engine task and wait for
//! its answer. Bodies of concurrent uploads are therefore received in
//! parallel while state changes stay serialized.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::{HeaderMap, header::CONTENT_RANGE},
    routing::{delete, get, post},
};
use bytes::Bytes;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::{
    coordinator::EngineCommand,
    error::{Result, TransferError},
    types::{
        CancelResponse, ChunkResponse, CompleteRequest, CompleteResponse, HealthResponse,
        InitRequest, InitResponse, TRANSFER_ID_HEADER, TransferStatusResponse,
    },
};

/// Router state: a line to the engine task.
#[derive(Clone)]
pub struct ReceiverApi {
    commands: UnboundedSender<EngineCommand>,
}

impl ReceiverApi {
    pub(crate) const fn new(commands: UnboundedSender<EngineCommand>) -> Self { Self { commands } }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineCommand,
    ) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| TransferError::EngineStopped)?;
        answer.await.map_err(|_| TransferError::EngineStopped)?
    }
}

/// Mounts the transfer endpoints on `router`.
pub fn routes(router: Router, api: ReceiverApi) -> Router {
    let transfer = Router::new()
        .route("/status", get(health))
        .route("/transfer/init", post(init))
        .route("/transfer/chunk", post(chunk))
        .route("/transfer/complete", post(complete))
        .route("/transfer/{id}/status", get(status))
        .route("/transfer/{id}", delete(cancel))
        .with_state(api);
    router.merge(transfer)
}

async fn health(State(api): State<ReceiverApi>) -> Result<Json<HealthResponse>> {
    api.ask(|reply| EngineCommand::Health { reply })
        .await
        .map(Json)
}

async fn init(
    State(api): State<ReceiverApi>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    payload: std::result::Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<InitResponse>> {
    let Json(request) = payload.map_err(|rejection| TransferError::Validation {
        reason: rejection.body_text(),
    })?;
    let peer = remote.ip().to_string();
    api.ask(|reply| EngineCommand::Init {
        request,
        peer,
        reply,
    })
    .await
    .map(Json)
}

async fn chunk(
    State(api): State<ReceiverApi>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkResponse>> {
    let header = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let transfer_id = header(TRANSFER_ID_HEADER);
    let content_range = header(CONTENT_RANGE.as_str());
    api.ask(|reply| EngineCommand::Chunk {
        transfer_id,
        content_range,
        body,
        reply,
    })
    .await
    .map(Json)
}

async fn complete(
    State(api): State<ReceiverApi>,
    payload: std::result::Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<CompleteResponse>> {
    let Json(request) = payload.map_err(|rejection| TransferError::Validation {
        reason: rejection.body_text(),
    })?;
    api.ask(|reply| EngineCommand::Complete {
        transfer_id: request.transfer_id,
        reply,
    })
    .await
    .map(Json)
}

async fn status(
    State(api): State<ReceiverApi>,
    Path(transfer_id): Path<String>,
) -> Result<Json<TransferStatusResponse>> {
    api.ask(|reply| EngineCommand::IncomingStatus { transfer_id, reply })
        .await
        .map(Json)
}

async fn cancel(
    State(api): State<ReceiverApi>,
    Path(transfer_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    api.ask(|reply| EngineCommand::IncomingCancel { transfer_id, reply })
        .await
        .map(Json)
}
