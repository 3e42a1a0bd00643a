mod chart;
pub use self::chart::{
    AdjClose, Bar, Chart, ChartError, ChartMeta, ChartResponse, ChartResult, Indicators, Quote,
};
