//! In-process discovery for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Announcement, Discovery, DiscoveryEvent};
use crate::error::Result;

struct Browser {
    owner: u64,
    service_type: String,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

#[derive(Default)]
struct NetworkInner {
    announced: BTreeMap<String, Announcement>,
    browsers: Vec<Browser>,
}

impl NetworkInner {
    fn publish(&mut self, service_type: &str, event: DiscoveryEvent) {
        self.browsers
            .retain(|b| b.service_type != service_type || b.tx.send(event.clone()).is_ok());
    }
}

/// Shared state connecting [`MemoryDiscovery`] handles.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<NetworkInner>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    /// Create a new memory network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a discovery handle on this network.
    pub fn discovery(self: &Arc<Self>) -> MemoryDiscovery {
        MemoryDiscovery {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            network: Arc::clone(self),
            announced: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One device's view of a [`MemoryNetwork`].
pub struct MemoryDiscovery {
    id: u64,
    network: Arc<MemoryNetwork>,
    announced: Mutex<Option<Announcement>>,
}

impl MemoryDiscovery {
    fn withdraw(&self, inner: &mut NetworkInner) {
        let previous = self
            .announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(previous) = previous {
            inner.announced.remove(&previous.name);
            inner.publish(
                &previous.service_type,
                DiscoveryEvent::Down {
                    name: previous.name,
                },
            );
        }
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn announce(&self, announcement: Announcement) -> Result<()> {
        let mut inner = self.network.lock();
        self.withdraw(&mut inner);
        inner
            .announced
            .insert(announcement.name.clone(), announcement.clone());
        inner.publish(
            &announcement.service_type,
            DiscoveryEvent::Up(announcement.clone()),
        );
        *self.announced.lock().unwrap_or_else(|e| e.into_inner()) = Some(announcement);
        Ok(())
    }

    async fn unannounce(&self) -> Result<()> {
        let mut inner = self.network.lock();
        self.withdraw(&mut inner);
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.network.lock();
        for announcement in inner.announced.values() {
            if announcement.service_type == service_type {
                let _ = tx.send(DiscoveryEvent::Up(announcement.clone()));
            }
        }
        inner.browsers.push(Browser {
            owner: self.id,
            service_type: service_type.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn stop_browsing(&self) -> Result<()> {
        self.network.lock().browsers.retain(|b| b.owner != self.id);
        Ok(())
    }
}
