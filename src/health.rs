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
use crate::grpc::health::v1::{
    health_check_response::ServingStatus,
    health_server::{Health, HealthServer},
    HealthCheckRequest, HealthCheckResponse,
};
use futures::Stream;
use log::info;
use std::pin::Pin;
use tonic::{Request, Response, Status};

/// gRPC health service that reports `SERVING` for as long as the process is
/// up.
#[derive(Debug, Default, Clone)]
pub struct HealthService;

impl HealthService {
    pub fn into_server(self) -> HealthServer<Self> {
        HealthServer::new(self)
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        info!("Received health check request: {:?}", request.get_ref());
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[tokio::test]
    async fn test_check_reports_serving() {
        let response = HealthService
            .check(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(response.get_ref().status(), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn test_watch_is_unimplemented() {
        let err = HealthService
            .watch(Request::new(HealthCheckRequest {
                service: "ext_proc".to_string(),
            }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
