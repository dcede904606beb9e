//! Node performance: traffic buckets plus latency percentiles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tdigests::TDigest;

use super::buckets::{TimeRange, TrafficSeries};
use crate::db::{NodeSample, NodeStatus};

/// One bucket of a node performance series. Empty buckets are all zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformancePoint {
    pub time: DateTime<Utc>,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub samples: usize,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_max: f64,
    /// Share of samples that reported the node online.
    pub online_ratio: f64,
    pub bandwidth_avg: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePerformance {
    pub node: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket_seconds: i64,
    pub points: Vec<PerformancePoint>,
}

fn sanitize_float(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Merge a node's traffic series with its status samples.
///
/// `samples` must fall inside the series range.
pub fn node_performance(node: &str, traffic: &TrafficSeries, samples: &[NodeSample]) -> NodePerformance {
    let range: TimeRange = traffic.range;
    let origin_ms = range.origin().timestamp_millis();
    let width_ms = range.bucket_secs() * 1000;

    let mut buckets: Vec<Vec<&NodeSample>> = vec![Vec::new(); traffic.len()];
    for sample in samples {
        let index = (sample.time.timestamp_millis() - origin_ms) / width_ms;
        if let Some(bucket) = usize::try_from(index).ok().and_then(|i| buckets.get_mut(i)) {
            bucket.push(sample);
        }
    }

    let points = traffic
        .iter()
        .zip(buckets)
        .map(|(bucket, members)| {
            let samples = members.len();
            if members.is_empty() {
                return PerformancePoint {
                    time: bucket.time,
                    bytes_in: bucket.bytes_in,
                    bytes_out: bucket.bytes_out,
                    samples,
                    latency_p50: 0.0,
                    latency_p95: 0.0,
                    latency_max: 0.0,
                    online_ratio: 0.0,
                    bandwidth_avg: 0.0,
                };
            }

            let latencies: Vec<f64> = members.iter().map(|s| s.latency_ms as f64).collect();
            let max = latencies.iter().copied().fold(f64::MIN, f64::max);
            let online = members.iter().filter(|s| s.status == NodeStatus::Online).count();
            let bandwidth: i64 = members.iter().map(|s| s.bandwidth).sum();
            let td = TDigest::from_values(latencies);

            PerformancePoint {
                time: bucket.time,
                bytes_in: bucket.bytes_in,
                bytes_out: bucket.bytes_out,
                samples,
                latency_p50: sanitize_float(td.estimate_quantile(0.50)),
                latency_p95: sanitize_float(td.estimate_quantile(0.95)),
                latency_max: sanitize_float(max),
                online_ratio: online as f64 / samples as f64,
                bandwidth_avg: bandwidth as f64 / samples as f64,
            }
        })
        .collect();

    NodePerformance {
        node: node.to_string(),
        start: range.start,
        end: range.end,
        bucket_seconds: range.bucket_secs(),
        points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BucketSum, EntityRef};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn sample(time: DateTime<Utc>, latency_ms: i64) -> NodeSample {
        NodeSample {
            time,
            status: NodeStatus::Online,
            latency_ms,
            bandwidth: 0,
        }
    }

    #[test]
    fn test_availability_and_bandwidth_per_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let range = TimeRange::new(start, start + ChronoDuration::minutes(2)).unwrap();
        let traffic = TrafficSeries::new(EntityRef::node("n1"), range, Vec::new());

        let samples = vec![
            NodeSample { bandwidth: 100, ..sample(start + ChronoDuration::seconds(5), 10) },
            NodeSample { bandwidth: 300, ..sample(start + ChronoDuration::seconds(15), 10) },
            NodeSample {
                status: NodeStatus::Error,
                bandwidth: 200,
                ..sample(start + ChronoDuration::seconds(25), 10)
            },
            NodeSample { bandwidth: 400, ..sample(start + ChronoDuration::seconds(35), 10) },
        ];

        let perf = node_performance("n1", &traffic, &samples);
        assert_eq!(perf.points[0].online_ratio, 0.75);
        assert_eq!(perf.points[0].bandwidth_avg, 250.0);
        assert_eq!(perf.points[1].online_ratio, 0.0);
    }

    #[test]
    fn test_percentiles_per_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let range = TimeRange::new(start, start + ChronoDuration::minutes(3)).unwrap();
        let traffic = TrafficSeries::new(
            EntityRef::node("n1"),
            range,
            vec![BucketSum { index: 0, bytes_in: 100, bytes_out: 50 }],
        );

        let samples: Vec<_> = (1..=100)
            .map(|i| sample(start + ChronoDuration::milliseconds(i * 500), i))
            .chain([sample(start + ChronoDuration::seconds(130), 40)])
            .collect();

        let perf = node_performance("n1", &traffic, &samples);
        assert_eq!(perf.points.len(), 3);
        assert_eq!(perf.bucket_seconds, 60);

        let first = &perf.points[0];
        assert_eq!(first.samples, 100);
        assert_eq!(first.bytes_in, 100);
        assert_eq!(first.latency_max, 100.0);
        assert!((first.latency_p50 - 50.0).abs() < 5.0);
        assert!((first.latency_p95 - 95.0).abs() < 5.0);

        // Empty bucket reports zeros
        let second = &perf.points[1];
        assert_eq!(second.samples, 0);
        assert_eq!(second.latency_p95, 0.0);

        assert_eq!(perf.points[2].latency_max, 40.0);
    }
}
