use std::collections::BTreeMap;

/// Finds the smallest common label set that still uniquely covers a
/// group of source or destination endpoints, by descending-frequency
/// subset search.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelAggregator {
    /// How much slack beyond `k` to allow when enumerating the
    /// top-`k+slack` frequency candidates for a subset of size `k`.
    slack: usize,
}

impl LabelAggregator {
    pub fn new() -> Self {
        Self { slack: 3 }
    }

    pub fn with_slack(slack: usize) -> Self {
        Self { slack }
    }

    /// Returns the smallest label subset present in every endpoint's
    /// label map. Falls back to the full label-set of the first endpoint
    /// when no smaller subset covers the group.
    pub fn find_common_selector(
        &self,
        endpoints: &[BTreeMap<String, String>],
    ) -> BTreeMap<String, String> {
        let Some(first) = endpoints.first() else {
            return BTreeMap::new();
        };
        if endpoints.len() == 1 {
            return first.clone();
        }

        let mut frequency: BTreeMap<(String, String), usize> = BTreeMap::new();
        for endpoint in endpoints {
            for pair in endpoint.iter().map(|(k, v)| (k.clone(), v.clone())) {
                *frequency.entry(pair).or_insert(0) += 1;
            }
        }
        let mut candidates: Vec<(String, String)> = frequency.keys().cloned().collect();
        candidates.sort_by(|a, b| {
            frequency[b]
                .cmp(&frequency[a])
                .then_with(|| a.cmp(b))
        });

        let smallest_endpoint_size = endpoints
            .iter()
            .map(|e| e.len())
            .min()
            .unwrap_or(0);

        for k in 1..=smallest_endpoint_size {
            if k + self.slack > 20 {
                // Combination pool would be too large to search; skip
                // straight to the full-label-set fallback for this k.
                continue;
            }
            let pool_size = (k + self.slack).min(candidates.len());
            let pool = &candidates[..pool_size];
            if let Some(found) = combinations(pool, k)
                .into_iter()
                .find(|combo| covers_all(combo, endpoints))
            {
                return found.into_iter().collect();
            }
        }

        first.clone()
    }
}

fn covers_all(combo: &[(String, String)], endpoints: &[BTreeMap<String, String>]) -> bool {
    endpoints.iter().all(|endpoint| {
        combo
            .iter()
            .all(|(k, v)| endpoint.get(k) == Some(v))
    })
}

/// All `k`-combinations of `pool`, in pool order (which is already
/// frequency-then-lexicographic sorted, so the result is deterministic).
fn combinations(pool: &[(String, String)], k: usize) -> Vec<Vec<(String, String)>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if pool.len() < k {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        out.push(indices.iter().map(|&i| pool[i].clone()).collect());

        let mut i = k;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if indices[i] != i + pool.len() - k {
                break;
            }
            if i == 0 {
                return out;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_label_selector_when_it_uniquely_covers() {
        let endpoints = vec![
            labels(&[("app", "api"), ("team", "payments")]),
            labels(&[("app", "api"), ("team", "infra")]),
        ];
        let agg = LabelAggregator::new();
        let selector = agg.find_common_selector(&endpoints);
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get("app").map(String::as_str), Some("api"));
    }

    #[test]
    fn falls_back_to_full_label_set_when_no_common_subset() {
        let endpoints = vec![
            labels(&[("app", "api")]),
            labels(&[("app", "web")]),
        ];
        let agg = LabelAggregator::new();
        let selector = agg.find_common_selector(&endpoints);
        assert_eq!(selector, labels(&[("app", "api")]));
    }

    #[test]
    fn requires_two_labels_when_one_alone_is_ambiguous() {
        let endpoints = vec![
            labels(&[("app", "api"), ("tier", "backend")]),
            labels(&[("app", "api"), ("tier", "frontend")]),
            labels(&[("app", "other"), ("tier", "backend")]),
        ];
        let agg = LabelAggregator::new();
        // Neither app=api nor tier=backend alone covers every endpoint;
        // no single-label subset is valid, so it falls back to the first
        // endpoint's full label set.
        let selector = agg.find_common_selector(&endpoints);
        assert_eq!(selector, endpoints[0].clone());
    }
}
