//! Primary Election
//!
//! Every survivor runs the same rule over the same active set, so the
//! cluster converges on one primary without an extra voting round: the
//! lexicographically smallest active node id wins.

/// Pick the new primary from the remaining active nodes
pub fn elect_primary<'a, I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    candidates.into_iter().min().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_id_wins() {
        let active = vec!["node-c".to_string(), "node-b".to_string()];
        assert_eq!(elect_primary(&active).as_deref(), Some("node-b"));
    }

    #[test]
    fn test_order_independent() {
        let a = vec!["n3".to_string(), "n1".to_string(), "n2".to_string()];
        let b = vec!["n2".to_string(), "n3".to_string(), "n1".to_string()];
        assert_eq!(elect_primary(&a), elect_primary(&b));
    }

    #[test]
    fn test_no_candidates() {
        let active: Vec<String> = Vec::new();
        assert!(elect_primary(&active).is_none());
    }
}
