//! Request outcome classification and counters.

use std::fmt;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

/// Coarse outcome of one request, used for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Hit,
    MissConfiguration,
    MissLoggedIn,
    MissQueryString,
    #[serde(rename = "miss_404")]
    Miss404,
    MissCompressed,
    MissEmptyResponse,
    MissNormalizationRedirect,
    MissFill,
    MissThirdParty,
    MissAjax,
    MissApiCall,
    MissWpAdmin,
    MissMfunc,
    MissRequestMethod,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::MissConfiguration => "miss_configuration",
            Self::MissLoggedIn => "miss_logged_in",
            Self::MissQueryString => "miss_query_string",
            Self::Miss404 => "miss_404",
            Self::MissCompressed => "miss_compressed",
            Self::MissEmptyResponse => "miss_empty_response",
            Self::MissNormalizationRedirect => "miss_normalization_redirect",
            Self::MissFill => "miss_fill",
            Self::MissThirdParty => "miss_third_party",
            Self::MissAjax => "miss_ajax",
            Self::MissApiCall => "miss_api_call",
            Self::MissWpAdmin => "miss_wp_admin",
            Self::MissMfunc => "miss_mfunc",
            Self::MissRequestMethod => "miss_request_method",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records the per-request counters: one outcome increment, the duration
/// (raw and in 10 ms buckets) and the emitted body size.
pub fn record_request(status: ProcessStatus, elapsed: Duration, response_bytes: usize) {
    counter!("page_cache.requests", "outcome" => status.as_str()).increment(1);
    counter!("page_cache.request_time_10ms").increment(duration_buckets(elapsed));
    histogram!("page_cache.request_duration").record(elapsed.as_secs_f64());
    counter!("page_cache.response_bytes").increment(response_bytes as u64);
}

fn duration_buckets(elapsed: Duration) -> u64 {
    (elapsed.as_millis() / 10).min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(ProcessStatus::Miss404.as_str(), "miss_404");
        assert_eq!(ProcessStatus::MissWpAdmin.to_string(), "miss_wp_admin");
        assert_eq!(
            serde_json::to_string(&ProcessStatus::MissNormalizationRedirect).expect("serialize"),
            "\"miss_normalization_redirect\""
        );
    }

    #[test]
    fn durations_bucket_by_ten_milliseconds() {
        assert_eq!(duration_buckets(Duration::from_millis(9)), 0);
        assert_eq!(duration_buckets(Duration::from_millis(25)), 2);
    }
}
