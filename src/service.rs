// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::context::RequestContext;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::envoy::service::ext_proc::v3::{
    external_processor_server::{ExternalProcessor, ExternalProcessorServer},
    ProcessingRequest, ProcessingResponse,
};
use crate::options::{CallbackErrorPolicy, ProcessingOptions};
use crate::phase::Phase;
use crate::processor::Processor;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status};

type ReplySender = mpsc::Sender<Result<ProcessingResponse, Status>>;

pub struct ExtProcService<P: Processor> {
    dispatcher: Dispatcher<P>,
}

impl<P: Processor> ExtProcService<P> {
    pub fn new(processor: P) -> Self {
        Self::from_arc(Arc::new(processor))
    }

    pub fn from_arc(processor: Arc<P>) -> Self {
        Self {
            dispatcher: Dispatcher::new(processor),
        }
    }

    /// Replaces the processor's own options.
    pub fn with_options(processor: Arc<P>, options: ProcessingOptions) -> Self {
        Self {
            dispatcher: Dispatcher::with_options(processor, options),
        }
    }

    pub fn options(&self) -> &ProcessingOptions {
        self.dispatcher.options()
    }

    pub fn into_server(self) -> ExternalProcessorServer<Self> {
        ExternalProcessorServer::new(self)
    }
}

/// Drives one ext_proc stream until the proxy closes it or it fails.
///
/// Every phase message gets exactly one reply on `tx`, in order, except
/// messages without a payload, which are skipped.
pub(crate) async fn run_session<P, S>(
    dispatcher: &Dispatcher<P>,
    inbound: S,
    tx: &ReplySender,
) -> Result<(), Status>
where
    P: Processor,
    S: Stream<Item = Result<ProcessingRequest, Status>>,
{
    tokio::pin!(inbound);
    let options = dispatcher.options();
    let mut ctx = RequestContext::<P::Data>::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => return Err(Status::cancelled("stream cancelled by the client")),
            next = inbound.next() => next,
        };
        let req = match next {
            None => return Ok(()),
            Some(Err(status)) => {
                return Err(Status::unknown(format!(
                    "cannot receive stream request: {}",
                    status
                )))
            }
            Some(Ok(req)) => req,
        };

        let phase = Phase::of(&req);
        if options.log_phases {
            info!("Processing {} phase: {:?}", phase, req.request);
        }

        let reply = match dispatcher.dispatch(&mut ctx, &req).await {
            Ok(reply) => reply,
            Err(DispatchError::UnknownPhase) => {
                warn!("Skipping processing request without a phase");
                continue;
            }
            Err(DispatchError::Callback(e)) => match options.on_callback_error {
                CallbackErrorPolicy::Abort => return Err(e.into()),
                CallbackErrorPolicy::Continue => {
                    warn!("{} callback failed, continuing: {}", phase, e);
                    dispatcher
                        .fallback_reply(&mut ctx, phase)
                        .map_err(|e| Status::internal(e.to_string()))?
                }
            },
            Err(e @ DispatchError::Mutation(_)) => return Err(Status::internal(e.to_string())),
        };

        if options.log_phases {
            info!("Replying to {} phase: {:?}", phase, reply.response);
        }
        if tx.send(Ok(reply)).await.is_err() {
            return Err(Status::unavailable("cannot send stream response"));
        }
    }
}

/// The `log_stream` line for a finished stream.
fn close_line(name: &str, result: &Result<(), Status>) -> String {
    match result {
        Ok(()) => format!("Stream closed for {}", name),
        Err(status) if status.code() == Code::Cancelled => {
            format!("Stream terminated for {}: cancelled", name)
        }
        Err(status) => format!("Stream terminated for {}: {}", name, status.message()),
    }
}

#[tonic::async_trait]
impl<P: Processor> ExternalProcessor for ExtProcService<P> {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<tonic::Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let log_stream = dispatcher.options().log_stream;
            if log_stream {
                info!("Stream opened for {}", dispatcher.processor().name());
            }

            let result = run_session(&dispatcher, inbound, &tx).await;
            if log_stream {
                info!("{}", close_line(dispatcher.processor().name(), &result));
            }

            match result {
                Ok(()) => {}
                Err(status) if status.code() == Code::Cancelled => {
                    debug!("Stream cancelled: {}", status.message());
                }
                Err(status) => {
                    warn!("Stream failed: {}", status);
                    let _ = tx.send(Err(status)).await;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
