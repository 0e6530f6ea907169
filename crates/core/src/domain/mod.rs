pub mod metrics;
pub mod observation;

pub use metrics::{
    AristocratStatus, CacheSummary, DataQuality, DividendMetrics, PayoutStatus, QualityBucket,
    QualityStatistics, ScreeningCriteria, rank_order,
};
pub use observation::{DividendObservation, Fundamentals, MarketSnapshot, PriceObservation};
