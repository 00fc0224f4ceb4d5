use async_trait::async_trait;
use relay_core::{Backplane, BackplaneConfig, MemoryBus, SendError, SessionId, SessionSender};
use relay_protocol::BroadcastEvent;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// One delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub session: SessionId,
    pub destination: String,
    pub event: BroadcastEvent,
}

/// Session sender that records deliveries and can simulate dead sessions.
#[derive(Default)]
pub struct RecordingSender {
    deliveries: Mutex<Vec<Delivery>>,
    dead: Mutex<HashSet<SessionId>>,
}

impl RecordingSender {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn kill(&self, session: &SessionId) {
        self.dead.lock().unwrap().insert(session.clone());
    }
}

#[async_trait]
impl SessionSender for RecordingSender {
    async fn send_to_session(
        &self,
        session: &SessionId,
        destination: &str,
        event: &BroadcastEvent,
    ) -> Result<(), SendError> {
        if self.dead.lock().unwrap().contains(session) {
            return Err(SendError::Closed);
        }
        self.deliveries.lock().unwrap().push(Delivery {
            session: session.clone(),
            destination: destination.to_string(),
            event: event.clone(),
        });
        Ok(())
    }
}

/// A backplane instance on a shared bus.
pub struct Instance {
    pub backplane: Backplane,
    pub sender: Arc<RecordingSender>,
}

pub fn instance(bus: &Arc<MemoryBus>) -> Instance {
    let sender = Arc::new(RecordingSender::default());
    let backplane = Backplane::new(bus.clone(), sender.clone(), BackplaneConfig::default());
    Instance { backplane, sender }
}
