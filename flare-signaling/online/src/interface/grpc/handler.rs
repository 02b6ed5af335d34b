use std::sync::Arc;

use flare_proto::flare::online::{GetOnlineStatusRequest, GetOnlineStatusResponse};
use tonic::{Request, Response, Status};
use tracing::error;

use crate::application::PresenceService;

pub struct OnlineHandler {
    service: Arc<PresenceService>,
}

impl OnlineHandler {
    pub fn new(service: Arc<PresenceService>) -> Self {
        Self { service }
    }

    pub async fn handle_get_online_status(
        &self,
        request: Request<GetOnlineStatusRequest>,
    ) -> std::result::Result<Response<GetOnlineStatusResponse>, Status> {
        let req = request.into_inner();
        match self.service.online_status(&req.user_ids).await {
            Ok(status) => Ok(Response::new(GetOnlineStatusResponse { status })),
            Err(err) => {
                error!(?err, "get_online_status failed");
                Err(Status::from(err))
            }
        }
    }
}
