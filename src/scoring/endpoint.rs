//! Fixed-size pool of FUJI scoring endpoints.
//!
//! Every endpoint carries its own concurrency budget, enforced with a
//! semaphore, and the pool hands endpoints out in round-robin order. The
//! rotation position survives across batches so load stays even when a
//! batch is smaller than the pool.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Internal port of the FUJI container image.
pub const FUJI_CONTAINER_PORT: u16 = 1071;

/// First host port used by the local compose layout.
pub const DEFAULT_PORT_BASE: u16 = 54001;

/// Default number of in-flight requests per endpoint.
pub const DEFAULT_PER_ENDPOINT_CONCURRENCY: usize = 3;

/// Endpoint template for FUJI instances published on localhost.
pub const LOCAL_TEMPLATE: &str = "http://localhost:{port}/fuji/api/v1/evaluate";

/// Endpoint template for FUJI services reached by compose service name.
pub const DOCKER_TEMPLATE: &str = "http://fuji{index}:1071/fuji/api/v1/evaluate";

/// How endpoint URLs are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// Expand a template containing `{index}` and/or `{port}`.
    Template {
        template: String,
        count: usize,
        port_base: u16,
    },
    /// Use the given URLs verbatim.
    Explicit(Vec<String>),
}

impl EndpointSource {
    /// Local layout: `count` instances on consecutive ports from `port_base`.
    pub fn local(count: usize, port_base: u16) -> Self {
        EndpointSource::Template {
            template: LOCAL_TEMPLATE.to_string(),
            count,
            port_base,
        }
    }

    /// Compose layout: services `fuji1..fujiN` on the container port.
    pub fn docker(count: usize) -> Self {
        EndpointSource::Template {
            template: DOCKER_TEMPLATE.to_string(),
            count,
            port_base: FUJI_CONTAINER_PORT,
        }
    }

    /// Expands the source into concrete URLs.
    pub fn urls(&self) -> Vec<String> {
        match self {
            EndpointSource::Explicit(urls) => urls.clone(),
            EndpointSource::Template {
                template,
                count,
                port_base,
            } => (1..=*count)
                .map(|index| expand_template(template, index, *port_base))
                .collect(),
        }
    }
}

/// Substitutes `{index}` (1-based) and `{port}` (`port_base + index - 1`).
pub fn expand_template(template: &str, index: usize, port_base: u16) -> String {
    let port = port_base as usize + index - 1;
    template
        .replace("{index}", &index.to_string())
        .replace("{port}", &port.to_string())
}

/// One remote scoring instance with its concurrency budget.
#[derive(Debug, Clone)]
pub struct Endpoint {
    index: usize,
    url: String,
    permits: Arc<Semaphore>,
}

impl Endpoint {
    fn new(index: usize, url: String, concurrency: usize) -> Self {
        Self {
            index,
            url,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Zero-based position of this endpoint in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Waits for a free slot on this endpoint.
    ///
    /// The slot is released when the returned permit is dropped.
    pub async fn acquire(&self) -> EndpointSlot {
        // The semaphore is never closed, so acquisition only waits.
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        EndpointSlot {
            endpoint: self.index,
            _permit: permit,
        }
    }

    /// Number of slots currently free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// A held unit of capacity on one endpoint.
#[derive(Debug)]
pub struct EndpointSlot {
    endpoint: usize,
    _permit: Option<OwnedSemaphorePermit>,
}

impl EndpointSlot {
    pub fn endpoint(&self) -> usize {
        self.endpoint
    }
}

/// Fixed ordered list of endpoints served round-robin.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    per_endpoint_concurrency: usize,
    cursor: usize,
}

impl EndpointPool {
    /// Builds a pool from URLs; every endpoint gets the same budget.
    ///
    /// Returns `None` when there are no URLs or the budget is zero.
    pub fn new(urls: Vec<String>, per_endpoint_concurrency: usize) -> Option<Self> {
        if urls.is_empty() || per_endpoint_concurrency == 0 {
            return None;
        }
        let endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| Endpoint::new(index, url, per_endpoint_concurrency))
            .collect();
        Some(Self {
            endpoints,
            per_endpoint_concurrency,
            cursor: 0,
        })
    }

    pub fn from_source(source: &EndpointSource, per_endpoint_concurrency: usize) -> Option<Self> {
        Self::new(source.urls(), per_endpoint_concurrency)
    }

    /// Returns the next endpoint in rotation.
    pub fn next_slot(&mut self) -> &Endpoint {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        &self.endpoints[index]
    }

    /// Assigns `count` work items to endpoints in rotation order.
    ///
    /// When `count` does not exceed [`capacity`](Self::capacity), no endpoint
    /// receives more items than its budget.
    pub fn assign(&mut self, count: usize) -> Vec<Endpoint> {
        (0..count).map(|_| self.next_slot().clone()).collect()
    }

    /// Total instantaneous capacity: endpoint count times per-endpoint budget.
    pub fn capacity(&self) -> usize {
        self.endpoints.len() * self.per_endpoint_concurrency
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn per_endpoint_concurrency(&self) -> usize {
        self.per_endpoint_concurrency
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("http://fuji{i}/evaluate")).collect()
    }

    #[test]
    fn test_local_template_expansion() {
        let urls = EndpointSource::local(3, DEFAULT_PORT_BASE).urls();
        assert_eq!(
            urls,
            vec![
                "http://localhost:54001/fuji/api/v1/evaluate",
                "http://localhost:54002/fuji/api/v1/evaluate",
                "http://localhost:54003/fuji/api/v1/evaluate",
            ]
        );
    }

    #[test]
    fn test_docker_template_expansion() {
        let urls = EndpointSource::docker(2).urls();
        assert_eq!(
            urls,
            vec![
                "http://fuji1:1071/fuji/api/v1/evaluate",
                "http://fuji2:1071/fuji/api/v1/evaluate",
            ]
        );
    }

    #[test]
    fn test_explicit_source_is_verbatim() {
        let source = EndpointSource::Explicit(vec!["http://a/x".to_string()]);
        assert_eq!(source.urls(), vec!["http://a/x".to_string()]);
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(EndpointPool::new(vec![], 3).is_none());
        assert!(EndpointPool::new(urls(2), 0).is_none());
    }

    #[test]
    fn test_capacity() {
        let pool = EndpointPool::new(urls(4), 3).expect("pool");
        assert_eq!(pool.capacity(), 12);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_round_robin_order() {
        let mut pool = EndpointPool::new(urls(3), 1).expect("pool");
        let order: Vec<usize> = (0..7).map(|_| pool.next_slot().index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_rotation_persists_across_assignments() {
        let mut pool = EndpointPool::new(urls(3), 2).expect("pool");
        let first: Vec<usize> = pool.assign(2).iter().map(Endpoint::index).collect();
        let second: Vec<usize> = pool.assign(2).iter().map(Endpoint::index).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2, 0]);
    }

    #[test]
    fn test_full_assignment_respects_budget() {
        let mut pool = EndpointPool::new(urls(4), 3).expect("pool");
        // Offset the cursor so the batch does not start at endpoint 0.
        pool.next_slot();

        let capacity = pool.capacity();
        let mut per_endpoint: HashMap<usize, usize> = HashMap::new();
        for endpoint in pool.assign(capacity) {
            *per_endpoint.entry(endpoint.index()).or_default() += 1;
        }
        assert_eq!(per_endpoint.len(), 4);
        assert!(per_endpoint.values().all(|&n| n == 3));
    }

    #[tokio::test]
    async fn test_slots_are_bounded_by_budget() {
        let pool = EndpointPool::new(urls(1), 2).expect("pool");
        let endpoint = pool.endpoints()[0].clone();

        let a = endpoint.acquire().await;
        let _b = endpoint.acquire().await;
        assert_eq!(endpoint.available_slots(), 0);
        assert_eq!(a.endpoint(), 0);

        drop(a);
        assert_eq!(endpoint.available_slots(), 1);
    }
}
