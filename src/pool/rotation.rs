/// Round robin over the auxiliary inference endpoints.
///
/// Advances once per dispatched task, independently of which slot the task
/// lands on, so load spreads evenly across endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    next: usize,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints, next: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The endpoint for the next dispatch, or `None` when none are configured.
    pub fn next_endpoint(&mut self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.endpoints[self.next % self.endpoints.len()].clone();
        self.next = self.next.wrapping_add(1);
        Some(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_in_order() {
        let mut rotation = EndpointRotation::new(vec!["a".into(), "b".into(), "c".into()]);
        let picks: Vec<String> = (0..7).filter_map(|_| rotation.next_endpoint()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn empty_rotation_yields_nothing() {
        let mut rotation = EndpointRotation::default();
        assert!(rotation.is_empty());
        assert_eq!(rotation.next_endpoint(), None);
    }
}
