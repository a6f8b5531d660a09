use crate::model::Revision;

/// Given `revision`'s `_revisions` history and a list of candidate revIDs
/// the remote reported as `possible_ancestors`, returns the generation
/// number of the first (most recent) entry in the full history that also
/// appears in `candidates`, or 0 if none match (spec §4.7).
///
/// This generation is the cutoff below which attachments can be stubbed:
/// the remote already has everything at or before that ancestor.
pub fn find_common_ancestor(revision: &Revision, candidates: &[String]) -> u32 {
    let Some((start, ids)) = revision.revisions_history() else {
        return 0;
    };

    for (offset, hash) in ids.iter().enumerate() {
        let generation = start.saturating_sub(offset as u32);
        let rev_id = format!("{generation}-{hash}");
        if candidates.iter().any(|candidate| candidate == &rev_id) {
            return generation;
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision_with_history(start: u32, ids: &[&str]) -> Revision {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "_revisions".to_string(),
            json!({ "start": start, "ids": ids }),
        );
        Revision::new("doc1", format!("{start}-{}", ids[0]), 1, properties)
    }

    fn strs(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_candidates_returns_zero() {
        let rev = revision_with_history(2, &["second", "first"]);
        assert_eq!(find_common_ancestor(&rev, &[]), 0);
    }

    #[test]
    fn no_matching_candidate_returns_zero() {
        let rev = revision_with_history(2, &["second", "first"]);
        assert_eq!(find_common_ancestor(&rev, &strs(&["3-noway", "1-nope"])), 0);
    }

    #[test]
    fn matches_older_generation() {
        let rev = revision_with_history(2, &["second", "first"]);
        assert_eq!(find_common_ancestor(&rev, &strs(&["3-noway", "1-first"])), 1);
    }

    #[test]
    fn prefers_the_most_recent_match() {
        let rev = revision_with_history(2, &["second", "first"]);
        assert_eq!(
            find_common_ancestor(&rev, &strs(&["3-noway", "2-second", "1-first"])),
            2
        );
    }

    #[test]
    fn no_history_returns_zero() {
        let rev = Revision::new("doc1", "1-a", 1, serde_json::Map::new());
        assert_eq!(find_common_ancestor(&rev, &strs(&["1-a"])), 0);
    }
}
