//! Endpoint rotation policies used when reconnecting

/// Picks the endpoint to try after the current one dropped
pub trait EndpointRotation: Send + Sync {
    fn next_endpoint(&mut self, current: &str) -> Option<String>;
}

/// Cycle through a fixed list of endpoints
#[derive(Debug, Clone, Default)]
pub struct RoundRobinEndpoints {
    endpoints: Vec<String>,
}

impl RoundRobinEndpoints {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }

    pub fn first(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }
}

impl EndpointRotation for RoundRobinEndpoints {
    fn next_endpoint(&mut self, current: &str) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        let next = match self.endpoints.iter().position(|e| e == current) {
            Some(i) => (i + 1) % self.endpoints.len(),
            None => 0,
        };
        Some(self.endpoints[next].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_wraps() {
        let mut rotation = RoundRobinEndpoints::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(rotation.next_endpoint("a").as_deref(), Some("b"));
        assert_eq!(rotation.next_endpoint("c").as_deref(), Some("a"));
        assert_eq!(rotation.next_endpoint("unknown").as_deref(), Some("a"));
    }

    #[test]
    fn test_empty_rotation_has_no_endpoint() {
        let mut rotation = RoundRobinEndpoints::default();
        assert!(rotation.next_endpoint("a").is_none());
        assert!(rotation.first().is_none());
    }
}
