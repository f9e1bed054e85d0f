//! Round-robin load balancer across a fixed set of reverse-proxy targets.
//!
//! The core does not health-check targets — they are assumed live, per the
//! scope's non-goals. Selection is a monotonically incremented counter
//! modulo the target count, protected by a mutex so concurrent requests
//! observe a consistent, evenly-distributed sequence.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Response};
use parking_lot::Mutex;

use crate::proxy::{BoxError, ReverseProxy};

pub struct LoadBalancer {
    targets: Vec<Arc<ReverseProxy>>,
    next: Mutex<usize>,
}

impl LoadBalancer {
    pub fn new(targets: Vec<Arc<ReverseProxy>>) -> Self {
        Self {
            targets,
            next: Mutex::new(0),
        }
    }

    fn pick(&self) -> Arc<ReverseProxy> {
        let mut next = self.next.lock();
        let idx = *next % self.targets.len();
        *next = next.wrapping_add(1);
        self.targets[idx].clone()
    }

    pub async fn serve(
        &self,
        req: Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
        inbound_is_tls: bool,
        metrics: &Arc<crate::metrics::Metrics>,
    ) -> Response<BoxBody<Bytes, BoxError>> {
        let target = self.pick();
        target.serve(req, remote_addr, inbound_is_tls, metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::WsConfig;
    use std::time::Duration;

    fn target(addr: &str) -> Arc<ReverseProxy> {
        Arc::new(ReverseProxy::new(
            "http",
            addr,
            WsConfig::default(),
            Duration::from_secs(0),
            false,
        ))
    }

    #[test]
    fn round_robin_distributes_evenly_across_targets() {
        let lb = LoadBalancer::new(vec![
            target("10.0.0.1:9000"),
            target("10.0.0.2:9000"),
            target("10.0.0.3:9000"),
        ]);

        let mut counts = [0usize; 3];
        for _ in 0..9 {
            let picked = lb.pick();
            let idx = lb
                .targets
                .iter()
                .position(|t| Arc::ptr_eq(t, &picked))
                .unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn round_robin_handles_counts_not_evenly_divisible() {
        let lb = LoadBalancer::new(vec![target("10.0.0.1:9000"), target("10.0.0.2:9000")]);
        let mut counts = [0usize; 2];
        for _ in 0..5 {
            let picked = lb.pick();
            let idx = lb
                .targets
                .iter()
                .position(|t| Arc::ptr_eq(t, &picked))
                .unwrap();
            counts[idx] += 1;
        }
        // 5 requests over 2 targets: floor(5/2)=2, ceil(5/2)=3
        assert!(counts.iter().all(|&c| c == 2 || c == 3));
        assert_eq!(counts[0] + counts[1], 5);
    }
}
