//! Bucket-to-treatment assignment over a condition's weighted partitions.
use crate::evaluator::CONTROL;
use crate::hashing::{self, HashAlgorithm};

use super::models::Partition;

/// Pick the treatment for `bucketing_key` given a condition's partitions.
///
/// A single 100% partition short-circuits without hashing. Otherwise the key
/// is hashed to a bucket in 1..=100 and partitions are walked in stored
/// order, returning the first whose cumulative weight covers the bucket.
pub fn get_treatment(
    bucketing_key: &str,
    seed: i64,
    algo: HashAlgorithm,
    partitions: &[Partition],
) -> String {
    if partitions.is_empty() {
        return CONTROL.to_owned();
    }

    if partitions.len() == 1 && partitions[0].size == 100 {
        return partitions[0].treatment.clone();
    }

    let bucket = hashing::bucket(algo, bucketing_key, seed);
    treatment_for_bucket(bucket, partitions)
}

fn treatment_for_bucket(bucket: u8, partitions: &[Partition]) -> String {
    let mut covered: i64 = 0;
    for partition in partitions {
        covered += partition.size;
        if covered >= bucket as i64 {
            return partition.treatment.clone();
        }
    }
    CONTROL.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(treatment: &str, size: i64) -> Partition {
        Partition {
            treatment: treatment.to_owned(),
            size,
        }
    }

    #[test]
    fn empty_partitions_return_control() {
        assert_eq!(
            get_treatment("key", 123, HashAlgorithm::Murmur3, &[]),
            CONTROL
        );
    }

    #[test]
    fn single_full_partition_skips_hashing() {
        let partitions = [partition("on", 100)];
        assert_eq!(
            get_treatment("any-key", 123, HashAlgorithm::Murmur3, &partitions),
            "on"
        );
    }

    #[test]
    fn bucket_walks_cumulative_weights_in_order() {
        let partitions = [partition("a", 10), partition("b", 30), partition("c", 60)];
        assert_eq!(treatment_for_bucket(1, &partitions), "a");
        assert_eq!(treatment_for_bucket(10, &partitions), "a");
        assert_eq!(treatment_for_bucket(11, &partitions), "b");
        assert_eq!(treatment_for_bucket(40, &partitions), "b");
        assert_eq!(treatment_for_bucket(41, &partitions), "c");
        assert_eq!(treatment_for_bucket(100, &partitions), "c");
    }

    #[test]
    fn bucket_beyond_total_weight_returns_control() {
        let partitions = [partition("a", 50)];
        assert_eq!(treatment_for_bucket(51, &partitions), CONTROL);
    }

    #[test]
    fn fifty_fifty_split_is_deterministic() {
        let partitions = [partition("on", 50), partition("off", 50)];
        for i in 0..100 {
            let key = format!("user-{i}");
            let first = get_treatment(&key, 1234, HashAlgorithm::Murmur3, &partitions);
            let second = get_treatment(&key, 1234, HashAlgorithm::Murmur3, &partitions);
            assert_eq!(first, second);
            assert!(first == "on" || first == "off");
        }
    }
}
