use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use policy_model::{PathRule, ProcessFileRules};
use regex::Regex;

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());

const NUMERIC_WILDCARD: &str = "{n}";

/// Prefix-tree construction and threshold-based aggregation of filesystem
/// paths into `matchPaths` + `matchDirectories`.
///
/// The trie is transient: it is built fresh for every call and discarded
/// once the rule set is emitted, per the "path trie ownership" design
/// note — only the aggregated strings outlive a round.
#[derive(Debug, Clone, Copy)]
pub struct PathAggregator {
    threshold: u32,
}

impl PathAggregator {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Aggregates a fresh set of paths with no prior knowledge.
    pub fn aggregate(&self, paths: &[String]) -> ProcessFileRules {
        self.aggregate_merge(paths, &ProcessFileRules::default())
    }

    /// Aggregates `paths`, treating `prior`'s `match_directories` as
    /// already-known directory rules: they are inserted first and their
    /// leaf nodes pre-flagged as directories, so new exact-path inserts
    /// under them collapse into the existing directory instead of
    /// re-emitting exact paths.
    pub fn aggregate_merge(&self, paths: &[String], prior: &ProcessFileRules) -> ProcessFileRules {
        let mut sorted: Vec<&String> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut root = TrieNode::default();
        for dir in &prior.match_directories {
            let segments = split_path(dir.path.trim_end_matches('/'));
            root.insert_directory_prefix(&segments, self.threshold);
        }
        for path in sorted {
            let segments = split_path(path);
            root.insert(&segments);
        }

        let mut match_paths = Vec::new();
        let mut match_directories = Vec::new();
        root.collect("", self.threshold, &mut match_paths, &mut match_directories);
        match_paths.sort_by(|a, b| a.path.cmp(&b.path));
        match_directories.sort_by(|a, b| a.path.cmp(&b.path));
        ProcessFileRules {
            match_paths,
            match_directories,
        }
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
struct TrieNode {
    touch_count: u32,
    is_directory: bool,
    children: BTreeMap<String, TrieNode>,
}

impl TrieNode {
    fn insert(&mut self, segments: &[String]) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };

        let mut key = head.clone();
        if NUMERIC_SEGMENT.is_match(head) {
            if self.children.contains_key(NUMERIC_WILDCARD) {
                key = NUMERIC_WILDCARD.to_string();
            } else if let Some(existing) = self
                .children
                .keys()
                .find(|k| k.as_str() != NUMERIC_WILDCARD && NUMERIC_SEGMENT.is_match(k))
                .cloned()
            {
                let promoted = self.children.remove(&existing).expect("just matched");
                self.children.insert(NUMERIC_WILDCARD.to_string(), promoted);
                key = NUMERIC_WILDCARD.to_string();
            }
        }

        let child = self.children.entry(key).or_default();
        child.touch_count += 1;
        child.insert(rest);
    }

    fn insert_directory_prefix(&mut self, segments: &[String], threshold: u32) {
        let Some((head, rest)) = segments.split_first() else {
            self.is_directory = true;
            self.touch_count = threshold + 1;
            return;
        };
        self.children
            .entry(head.clone())
            .or_default()
            .insert_directory_prefix(rest, threshold);
    }

    fn collect(
        &self,
        prefix: &str,
        threshold: u32,
        paths: &mut Vec<PathRule>,
        dirs: &mut Vec<PathRule>,
    ) {
        for (segment, child) in &self.children {
            let current = format!("{prefix}/{segment}");
            if child.is_directory || child.children.len() as u32 > threshold {
                dirs.push(PathRule {
                    path: format!("{current}/"),
                    is_directory: true,
                    read_only: None,
                    owner_only: None,
                    from_source: Vec::new(),
                });
            } else if child.children.is_empty() {
                paths.push(PathRule {
                    path: current,
                    is_directory: false,
                    read_only: None,
                    owner_only: None,
                    from_source: Vec::new(),
                });
            } else {
                child.collect(&current, threshold, paths, dirs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn e1_above_threshold_collapses_to_directory() {
        let agg = PathAggregator::new(3);
        let result = agg.aggregate(&paths(&[
            "/usr/lib/a.py",
            "/usr/lib/b.py",
            "/usr/lib/c.py",
            "/usr/lib/d.py",
        ]));
        assert_eq!(result.match_paths, Vec::new());
        assert_eq!(result.match_directories.len(), 1);
        assert_eq!(result.match_directories[0].path, "/usr/lib/");
    }

    #[test]
    fn e1_below_threshold_stays_exact() {
        let agg = PathAggregator::new(3);
        let result = agg.aggregate(&paths(&["/usr/lib/a.py", "/usr/lib/b.py"]));
        assert!(result.match_directories.is_empty());
        let emitted: Vec<&str> = result.match_paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(emitted, vec!["/usr/lib/a.py", "/usr/lib/b.py"]);
    }

    #[test]
    fn idempotent_on_repeated_input() {
        let agg = PathAggregator::new(3);
        let input = paths(&["/a/b/c", "/a/b/d", "/a/e"]);
        let once = agg.aggregate(&input);
        let twice = agg.aggregate(&input);
        assert_eq!(once.match_paths, twice.match_paths);
        assert_eq!(once.match_directories, twice.match_directories);
    }

    #[test]
    fn merge_mode_collapses_new_paths_into_known_directory() {
        let agg = PathAggregator::new(3);
        let prior = agg.aggregate(&paths(&[
            "/usr/lib/a.py",
            "/usr/lib/b.py",
            "/usr/lib/c.py",
            "/usr/lib/d.py",
        ]));
        assert_eq!(prior.match_directories[0].path, "/usr/lib/");

        let merged = agg.aggregate_merge(&paths(&["/usr/lib/e.py"]), &prior);
        assert_eq!(merged.match_directories.len(), 1);
        assert_eq!(merged.match_directories[0].path, "/usr/lib/");
        assert!(merged.match_paths.is_empty());
    }

    #[test]
    fn numeric_siblings_collapse_to_wildcard() {
        let agg = PathAggregator::new(3);
        let result = agg.aggregate(&paths(&["/proc/1/status", "/proc/2/status"]));
        assert!(result
            .match_paths
            .iter()
            .any(|p| p.path == "/proc/{n}/status"));
    }
}
