//! C1: split a [`TestSuite`] into up to `N` balanced [`Partition`]s, never splitting a class
//! across workers.

use std::collections::HashMap;

use itertools::Itertools;

use crate::testcase::{Partition, TestCase, TestSuite};

/// Groups `suite`'s cases by [`TestCase::class_key`], then round-robins whole groups (in
/// first-seen order) across `count` buckets. Empty buckets are dropped, so the returned `Vec` may
/// have fewer than `count` entries if there are fewer distinct classes than workers requested.
///
/// `suite` is consumed: the caller cannot use it (or any test case it contained) afterwards,
/// matching the contract that ownership of each case passes to exactly one partition.
pub fn partition(suite: TestSuite, count: usize) -> Vec<Partition> {
    assert!(count > 0, "partition count must be positive");

    // First-seen order of distinct classes, so the round-robin assignment below is deterministic
    // for a given input ordering.
    let order: Vec<String> = suite.cases.iter().map(|c| c.class_key()).unique().collect();

    let mut groups: HashMap<String, Vec<Box<dyn TestCase>>> = suite
        .cases
        .into_iter()
        .map(|case| (case.class_key(), case))
        .into_group_map();

    let mut buckets: Vec<Vec<Box<dyn TestCase>>> = (0..count).map(|_| Vec::new()).collect();
    for (i, key) in order.into_iter().enumerate() {
        let cases = groups.remove(&key).expect("key was just inserted above");
        buckets[i % count].extend(cases);
    }

    buckets
        .into_iter()
        .filter(|b| !b.is_empty())
        .map(|cases| Partition { cases })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use test_case::test_case;

    use crate::testcase::OutcomeSink;

    use super::*;

    struct StubCase {
        id: String,
        class_key: String,
    }

    impl TestCase for StubCase {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn class_key(&self) -> String {
            self.class_key.clone()
        }

        fn run(&mut self, _sink: &mut dyn OutcomeSink) {
            unreachable!("partitioner never runs tests")
        }
    }

    fn suite_of(classes: &[(&str, usize)]) -> TestSuite {
        let mut cases: Vec<Box<dyn TestCase>> = Vec::new();
        for (class, n) in classes {
            for i in 0..*n {
                cases.push(Box::new(StubCase {
                    id: format!("{class}.case{i}"),
                    class_key: class.to_string(),
                }));
            }
        }
        TestSuite::new(cases)
    }

    #[test]
    fn round_robins_whole_classes() {
        let suite = suite_of(&[("A", 2), ("B", 2), ("C", 2), ("D", 2)]);
        let partitions = partition(suite, 2);
        assert_eq!(partitions.len(), 2);

        let class_of = |id: &str| id.split('.').next().unwrap().to_string();
        let classes_in = |p: &crate::testcase::Partition| -> Vec<String> {
            let mut v: Vec<String> = p.cases.iter().map(|c| class_of(&c.id())).collect();
            v.sort();
            v.dedup();
            v
        };
        assert_eq!(classes_in(&partitions[0]), vec!["A", "C"]);
        assert_eq!(classes_in(&partitions[1]), vec!["B", "D"]);
    }

    #[test]
    fn never_splits_a_class() {
        let suite = suite_of(&[("A", 5), ("B", 1)]);
        let partitions = partition(suite, 2);
        let mut seen: Map<String, usize> = Map::new();
        for (i, p) in partitions.iter().enumerate() {
            for case in &p.cases {
                let class = case.class_key();
                if let Some(&prev) = seen.get(&class) {
                    assert_eq!(prev, i, "class {class} split across partitions");
                } else {
                    seen.insert(class, i);
                }
            }
        }
    }

    #[test_case(&[("A", 1), ("B", 1)], 3, 2, 2; "more workers than classes drops empty partitions")]
    #[test_case(&[("A", 3), ("B", 4), ("C", 1)], 3, 3, 8; "three classes over three workers")]
    #[test_case(&[("A", 2), ("B", 3)], 1, 1, 5; "single worker gets everything")]
    fn preserves_total_and_drops_empties(
        classes: &[(&str, usize)],
        workers: usize,
        expected_partitions: usize,
        expected_total: usize,
    ) {
        let suite = suite_of(classes);
        let partitions = partition(suite, workers);
        assert_eq!(partitions.len(), expected_partitions);
        let got: usize = partitions.iter().map(|p| p.cases.len()).sum();
        assert_eq!(got, expected_total);
    }
}
