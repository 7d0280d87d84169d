//! Algorithm tags, option records, and the textual algorithm-spec parser.
//!
//! A gridding run is described by a string of the form
//! `name[:key=value]*`, e.g. `invdist:power=3:radius1=120:nodata=-9999`.
//! [`parse_spec`] resolves the name to an [`Algorithm`] tag and fills a
//! [`GridOptions`] record with defaults for every key the string omits.
//! Keys are case-insensitive; unknown keys are silently ignored so that
//! callers can pass through option strings containing driver-level keys.

/// The supported gridding algorithms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Inverse distance to a power, with an optional search ellipse.
    InverseDistanceToAPower,
    /// Inverse distance over the whole point set (no search ellipse).
    InverseDistanceNoSearch,
    /// Moving average over the search ellipse.
    MovingAverage,
    /// Value of the nearest sample.
    NearestNeighbor,
    /// Minimum sample value in the search ellipse.
    MetricMinimum,
    /// Maximum sample value in the search ellipse.
    MetricMaximum,
    /// Difference between the maximum and minimum in the search ellipse.
    MetricRange,
    /// Number of samples in the search ellipse.
    MetricCount,
    /// Mean distance from the cell center to the samples in the ellipse.
    MetricAverageDistance,
    /// Mean pairwise distance between the samples in the ellipse.
    MetricAverageDistancePts,
    /// Barycentric interpolation over a Delaunay triangulation.
    Linear,
}

const ALG_NAME_INVDIST: &str = "invdist";
const ALG_NAME_INVDISTNN: &str = "invdistnn";
const ALG_NAME_AVERAGE: &str = "average";
const ALG_NAME_NEAREST: &str = "nearest";
const ALG_NAME_MINIMUM: &str = "minimum";
const ALG_NAME_MAXIMUM: &str = "maximum";
const ALG_NAME_RANGE: &str = "range";
const ALG_NAME_COUNT: &str = "count";
const ALG_NAME_AVERAGE_DISTANCE: &str = "average_distance";
const ALG_NAME_AVERAGE_DISTANCE_PTS: &str = "average_distance_pts";
const ALG_NAME_LINEAR: &str = "linear";

/// Errors surfaced by [`parse_spec`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported gridding method \"{0}\"")]
    UnknownAlgorithm(String),
    #[error("invalid value `{value}` for key `{key}`")]
    InvalidValue { key: String, value: String },
}

/// Options for inverse distance to a power with a search ellipse.
#[derive(Clone, Debug)]
pub struct InverseDistanceOptions {
    /// Weighting power `p` in `w = 1 / r^p`.
    pub power: f64,
    /// Smoothing parameter added (squared) to every distance.
    pub smoothing: f64,
    /// First semi-axis of the search ellipse. Zero together with
    /// `radius2` means "no search" (the whole plane).
    pub radius1: f64,
    /// Second semi-axis of the search ellipse.
    pub radius2: f64,
    /// Ellipse rotation, degrees counter-clockwise.
    pub angle: f64,
    /// Stop accumulating after this many samples; 0 = unlimited.
    pub max_points: u32,
    /// Emit `nodata` when fewer samples are found; 0 = no minimum.
    pub min_points: u32,
    /// Value emitted when no result can be computed.
    pub nodata: f64,
}

impl Default for InverseDistanceOptions {
    fn default() -> Self {
        Self {
            power: 2.0,
            smoothing: 0.0,
            radius1: 0.0,
            radius2: 0.0,
            angle: 0.0,
            max_points: 0,
            min_points: 0,
            nodata: 0.0,
        }
    }
}

/// Options for the no-search inverse-distance variant.
#[derive(Clone, Debug)]
pub struct NoSearchOptions {
    /// Weighting power `p` in `w = 1 / r^p`.
    pub power: f64,
    /// Smoothing parameter added (squared) to every distance.
    pub smoothing: f64,
    /// Value emitted when the denominator vanishes.
    pub nodata: f64,
}

impl Default for NoSearchOptions {
    fn default() -> Self {
        Self { power: 2.0, smoothing: 0.0, nodata: 0.0 }
    }
}

/// Options for the moving-average algorithm.
#[derive(Clone, Debug, Default)]
pub struct MovingAverageOptions {
    pub radius1: f64,
    pub radius2: f64,
    pub angle: f64,
    pub min_points: u32,
    pub nodata: f64,
}

/// Options for the nearest-neighbor algorithm.
#[derive(Clone, Debug, Default)]
pub struct NearestNeighborOptions {
    pub radius1: f64,
    pub radius2: f64,
    pub angle: f64,
    pub nodata: f64,
}

/// Options shared by the six data-metric algorithms.
#[derive(Clone, Debug, Default)]
pub struct DataMetricsOptions {
    pub radius1: f64,
    pub radius2: f64,
    pub angle: f64,
    pub min_points: u32,
    pub nodata: f64,
}

/// Options for barycentric linear interpolation.
#[derive(Clone, Debug)]
pub struct LinearOptions {
    /// Search radius for the outside-hull fallback. Negative means an
    /// unlimited nearest-neighbor fallback; zero disables the fallback
    /// and emits `nodata` outside the convex hull.
    pub radius: f64,
    /// Value emitted outside the hull when the fallback is disabled or
    /// finds nothing.
    pub nodata: f64,
}

impl Default for LinearOptions {
    fn default() -> Self {
        Self { radius: -1.0, nodata: 0.0 }
    }
}

/// A fully resolved option record, one variant per algorithm family.
///
/// The six data metrics accept the same keys and share a record; the
/// [`Algorithm`] tag disambiguates them.
#[derive(Clone, Debug)]
pub enum GridOptions {
    InverseDistance(InverseDistanceOptions),
    NoSearch(NoSearchOptions),
    MovingAverage(MovingAverageOptions),
    Nearest(NearestNeighborOptions),
    Metric(DataMetricsOptions),
    Linear(LinearOptions),
}

impl GridOptions {
    /// The nodata sentinel of any variant.
    pub fn nodata(&self) -> f64 {
        match self {
            GridOptions::InverseDistance(o) => o.nodata,
            GridOptions::NoSearch(o) => o.nodata,
            GridOptions::MovingAverage(o) => o.nodata,
            GridOptions::Nearest(o) => o.nodata,
            GridOptions::Metric(o) => o.nodata,
            GridOptions::Linear(o) => o.nodata,
        }
    }
}

/// Key/value lookup over the `:`-separated tail of the algorithm string.
struct KeyValues<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> KeyValues<'a> {
    fn new(tokens: impl Iterator<Item = &'a str>) -> Self {
        // Tokens without an `=` carry no value and are dropped, like the
        // name/value list helpers of the original option strings.
        let pairs = tokens.filter_map(|t| t.split_once('=')).collect();
        Self { pairs }
    }

    fn fetch(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|&(_, v)| v)
    }

    /// Parse the value for `key` as a locale-independent decimal, or
    /// return `default` when the key is absent.
    fn number(&self, key: &str, default: f64) -> Result<f64, ParseError> {
        match self.fetch(key) {
            None => Ok(default),
            Some(v) => v.trim().parse::<f64>().map_err(|_| ParseError::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// Like [`Self::number`] but truncated to a point count.
    fn count(&self, key: &str) -> Result<u32, ParseError> {
        Ok(self.number(key, 0.0)? as u32)
    }
}

/// Parse an algorithm-spec string into its tag and option record.
///
/// An empty string resolves to `invdist` with all defaults. An
/// unrecognized algorithm name is a hard error; unrecognized keys are
/// ignored.
pub fn parse_spec(spec: &str) -> Result<(Algorithm, GridOptions), ParseError> {
    let mut tokens = spec.split(':').filter(|t| !t.is_empty());
    let name = match tokens.next() {
        Some(n) => n,
        None => {
            return Ok((
                Algorithm::InverseDistanceToAPower,
                GridOptions::InverseDistance(InverseDistanceOptions::default()),
            ))
        }
    };
    let kv = KeyValues::new(tokens);

    let algorithm = if name.eq_ignore_ascii_case(ALG_NAME_INVDIST) {
        Algorithm::InverseDistanceToAPower
    } else if name.eq_ignore_ascii_case(ALG_NAME_INVDISTNN) {
        Algorithm::InverseDistanceNoSearch
    } else if name.eq_ignore_ascii_case(ALG_NAME_AVERAGE) {
        Algorithm::MovingAverage
    } else if name.eq_ignore_ascii_case(ALG_NAME_NEAREST) {
        Algorithm::NearestNeighbor
    } else if name.eq_ignore_ascii_case(ALG_NAME_MINIMUM) {
        Algorithm::MetricMinimum
    } else if name.eq_ignore_ascii_case(ALG_NAME_MAXIMUM) {
        Algorithm::MetricMaximum
    } else if name.eq_ignore_ascii_case(ALG_NAME_RANGE) {
        Algorithm::MetricRange
    } else if name.eq_ignore_ascii_case(ALG_NAME_COUNT) {
        Algorithm::MetricCount
    } else if name.eq_ignore_ascii_case(ALG_NAME_AVERAGE_DISTANCE) {
        Algorithm::MetricAverageDistance
    } else if name.eq_ignore_ascii_case(ALG_NAME_AVERAGE_DISTANCE_PTS) {
        Algorithm::MetricAverageDistancePts
    } else if name.eq_ignore_ascii_case(ALG_NAME_LINEAR) {
        Algorithm::Linear
    } else {
        return Err(ParseError::UnknownAlgorithm(name.to_string()));
    };

    let options = match algorithm {
        Algorithm::InverseDistanceToAPower => {
            GridOptions::InverseDistance(InverseDistanceOptions {
                power: kv.number("power", 2.0)?,
                smoothing: kv.number("smoothing", 0.0)?,
                radius1: kv.number("radius1", 0.0)?,
                radius2: kv.number("radius2", 0.0)?,
                angle: kv.number("angle", 0.0)?,
                max_points: kv.count("max_points")?,
                min_points: kv.count("min_points")?,
                nodata: kv.number("nodata", 0.0)?,
            })
        }
        Algorithm::InverseDistanceNoSearch => GridOptions::NoSearch(NoSearchOptions {
            power: kv.number("power", 2.0)?,
            smoothing: kv.number("smoothing", 0.0)?,
            nodata: kv.number("nodata", 0.0)?,
        }),
        Algorithm::MovingAverage => GridOptions::MovingAverage(MovingAverageOptions {
            radius1: kv.number("radius1", 0.0)?,
            radius2: kv.number("radius2", 0.0)?,
            angle: kv.number("angle", 0.0)?,
            min_points: kv.count("min_points")?,
            nodata: kv.number("nodata", 0.0)?,
        }),
        Algorithm::NearestNeighbor => GridOptions::Nearest(NearestNeighborOptions {
            radius1: kv.number("radius1", 0.0)?,
            radius2: kv.number("radius2", 0.0)?,
            angle: kv.number("angle", 0.0)?,
            nodata: kv.number("nodata", 0.0)?,
        }),
        Algorithm::MetricMinimum
        | Algorithm::MetricMaximum
        | Algorithm::MetricRange
        | Algorithm::MetricCount
        | Algorithm::MetricAverageDistance
        | Algorithm::MetricAverageDistancePts => GridOptions::Metric(DataMetricsOptions {
            radius1: kv.number("radius1", 0.0)?,
            radius2: kv.number("radius2", 0.0)?,
            angle: kv.number("angle", 0.0)?,
            min_points: kv.count("min_points")?,
            nodata: kv.number("nodata", 0.0)?,
        }),
        Algorithm::Linear => GridOptions::Linear(LinearOptions {
            radius: kv.number("radius", -1.0)?,
            nodata: kv.number("nodata", 0.0)?,
        }),
    };

    Ok((algorithm, options))
}
