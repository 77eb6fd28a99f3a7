//! In-process company service.
//!
//! [`MemoryServer`] implements [`CompanyTransport`] against a list held in
//! memory, publishing `companyAdded` and `companyNameChanged` to every
//! subscriber the way the real service does (including the client that made
//! the change). Deletes are not published.
//!
//! Fault injection lets tests and the CLI exercise rollback paths:
//!
//! - [`Fault::Unreachable`]: the request never reaches the server
//! - [`Fault::Reject`]: the server refuses the change
//! - [`Fault::LostResponse`]: the server applies the change (and pushes it),
//!   but the response is lost on the way back

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use kaisha_types::{Company, CompanyId, PushEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::constants::PUSH_CHANNEL_CAPACITY;
use crate::transport::{CompanyTransport, TransportError};

/// A scripted failure for the next mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    Reject(String),
    LostResponse,
}

#[derive(Debug, Default)]
struct ServerState {
    companies: Vec<Company>,
    next_id: i64,
    faults: VecDeque<Fault>,
}

impl ServerState {
    fn position(&self, id: CompanyId) -> Option<usize> {
        self.companies.iter().position(|c| c.id == id)
    }
}

/// In-memory company service with a push channel.
pub struct MemoryServer {
    state: Mutex<ServerState>,
    events: broadcast::Sender<PushEvent>,
    latency: Mutex<Duration>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ServerState { next_id: 1, ..ServerState::default() }),
            events,
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Seed with names; ids are assigned from 1.
    pub fn with_companies<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let server = Self::new();
        {
            let mut state = server.state.lock();
            for name in names {
                let id = CompanyId::new(state.next_id);
                state.next_id += 1;
                state.companies.push(Company::new(id, name));
            }
        }
        server
    }

    /// Delay every mutation response by `latency`. Successful changes are
    /// applied and pushed before the delay.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail the next mutation with `fault`. Faults queue up in order.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Server-side view, for assertions.
    pub fn companies(&self) -> Vec<Company> {
        self.state.lock().companies.clone()
    }

    // =========================================================================
    // Changes made by other clients
    // =========================================================================

    /// Another client adds a company.
    pub fn external_add(&self, name: &str) -> Company {
        let company = self.state.lock().add(name);
        self.publish(PushEvent::CompanyAdded { company: company.clone() });
        company
    }

    /// Another client renames a company. `None` if the id is unknown.
    pub fn external_rename(&self, id: CompanyId, name: &str) -> Option<Company> {
        let company = self.state.lock().rename(id, name).ok()?;
        self.publish(PushEvent::CompanyRenamed { id, name: company.name.clone() });
        Some(company)
    }

    /// Another client deletes a company. Nothing is pushed.
    pub fn external_delete(&self, id: CompanyId) -> bool {
        self.state.lock().delete(id).is_ok()
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn take_fault(&self) -> Option<Fault> {
        self.state.lock().faults.pop_front()
    }

    fn publish(&self, event: PushEvent) {
        debug!("memory server: push {:?}", event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn respond<T>(&self, fault: Option<Fault>, result: Result<T, TransportError>) -> Result<T, TransportError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(Fault::LostResponse) => Err(TransportError::Unreachable("response lost".into())),
            _ => result,
        }
    }

    /// Short-circuit faults that stop the request before it is applied.
    fn pre_apply(fault: &Option<Fault>) -> Option<TransportError> {
        match fault {
            Some(Fault::Unreachable) => Some(TransportError::Unreachable("connection refused".into())),
            Some(Fault::Reject(msg)) => Some(TransportError::Rejected(msg.clone())),
            _ => None,
        }
    }
}

impl ServerState {
    fn add(&mut self, name: &str) -> Company {
        let company = Company::new(self.next_id, name);
        self.next_id += 1;
        self.companies.push(company.clone());
        company
    }

    fn rename(&mut self, id: CompanyId, name: &str) -> Result<Company, TransportError> {
        let index = self.position(id).ok_or(TransportError::NotFound(id))?;
        self.companies[index].name = name.to_string();
        Ok(self.companies[index].clone())
    }

    fn delete(&mut self, id: CompanyId) -> Result<(), TransportError> {
        let index = self.position(id).ok_or(TransportError::NotFound(id))?;
        self.companies.remove(index);
        Ok(())
    }
}

#[async_trait]
impl CompanyTransport for MemoryServer {
    async fn fetch_all(&self) -> Result<Vec<Company>, TransportError> {
        Ok(self.companies())
    }

    async fn add_company(&self, name: &str) -> Result<Company, TransportError> {
        let fault = self.take_fault();
        if let Some(e) = Self::pre_apply(&fault) {
            return self.respond(None, Err(e)).await;
        }
        let company = self.state.lock().add(name);
        info!("memory server: added {:?} {:?}", company.id, company.name);
        self.publish(PushEvent::CompanyAdded { company: company.clone() });
        self.respond(fault, Ok(company)).await
    }

    async fn change_company_name(
        &self,
        id: CompanyId,
        name: &str,
    ) -> Result<Company, TransportError> {
        let fault = self.take_fault();
        if let Some(e) = Self::pre_apply(&fault) {
            return self.respond(None, Err(e)).await;
        }
        let result = self.state.lock().rename(id, name);
        if let Ok(company) = &result {
            info!("memory server: renamed {:?} to {:?}", id, company.name);
            self.publish(PushEvent::CompanyRenamed { id, name: company.name.clone() });
        }
        self.respond(fault, result).await
    }

    async fn delete_company(&self, id: CompanyId) -> Result<(), TransportError> {
        let fault = self.take_fault();
        if let Some(e) = Self::pre_apply(&fault) {
            return self.respond(None, Err(e)).await;
        }
        let result = self.state.lock().delete(id);
        if result.is_ok() {
            info!("memory server: deleted {:?}", id);
        }
        self.respond(fault, result).await
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }
}
