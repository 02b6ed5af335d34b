use std::sync::Arc;

use flare_proto::flare::online::online_status_service_server::OnlineStatusService;
use flare_proto::flare::online::{GetOnlineStatusRequest, GetOnlineStatusResponse};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::interface::grpc::handler::OnlineHandler;

#[derive(Clone)]
pub struct OnlineStatusServer {
    handler: Arc<OnlineHandler>,
}

impl OnlineStatusServer {
    /// 从已有的 handler 创建服务器（用于 bootstrap）
    pub fn from_handler(handler: Arc<OnlineHandler>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl OnlineStatusService for OnlineStatusServer {
    async fn get_online_status(
        &self,
        request: Request<GetOnlineStatusRequest>,
    ) -> std::result::Result<Response<GetOnlineStatusResponse>, Status> {
        debug!(users = request.get_ref().user_ids.len(), "get online status request");
        self.handler.handle_get_online_status(request).await
    }
}
