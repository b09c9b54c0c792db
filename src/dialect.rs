//! SQL dialect tags and the static engine-feature gate table.
//!
//! Every IR, patch plan, and prompt carries a [`Dialect`]. Capability
//! differences between engines (does the engine support `QUALIFY`?) are
//! answered by one static table here rather than scattered conditionals.

use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{DuckDbDialect, PostgreSqlDialect, SnowflakeDialect};
use thiserror::Error;

/// SQL variant of the target engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "duck", alias = "duckdb")]
    DuckDb,
    #[serde(alias = "postgresql")]
    Postgres,
    Snowflake,
}

impl Dialect {
    /// The sqlparser dialect used to parse full scripts in this variant.
    pub fn parser(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        match self {
            Dialect::DuckDb => Box::new(DuckDbDialect {}),
            Dialect::Postgres => Box::new(PostgreSqlDialect {}),
            Dialect::Snowflake => Box::new(SnowflakeDialect {}),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::DuckDb => "duckdb",
            Dialect::Postgres => "postgres",
            Dialect::Snowflake => "snowflake",
        }
    }

    /// Whether this engine supports `feature` at `version`.
    ///
    /// `version` is the engine version string from the connection spec
    /// (e.g. `"0.10.2"`, `"14.3"`); `None` means "current".
    pub fn supports(&self, feature: EngineFeature, version: Option<&EngineVersion>) -> bool {
        for gate in FEATURE_GATES {
            if gate.dialect == *self && gate.feature == feature {
                return match (gate.min_version, version) {
                    (None, _) => gate.supported,
                    (Some(min), Some(v)) => gate.supported && *v >= min,
                    // Unknown version: assume current, which satisfies any gate.
                    (Some(_), None) => gate.supported,
                };
            }
        }
        false
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("unknown dialect: {name}")]
#[diagnostic(
    code(sqlbeam::dialect::unknown),
    help("supported dialects are duckdb, postgres, snowflake")
)]
pub struct UnknownDialect {
    pub name: String,
}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckdb" | "duck" => Ok(Dialect::DuckDb),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "snowflake" => Ok(Dialect::Snowflake),
            other => Err(UnknownDialect {
                name: other.to_string(),
            }),
        }
    }
}

/// Engine capabilities that transforms may require or be contraindicated by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFeature {
    Qualify,
    Pivot,
    LateralJoin,
    SemiJoinSyntax,
    Tablesample,
    MaterializedCte,
}

/// Parsed `major.minor` engine version, ordered numerically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Lenient parse: `"0.10.2"` -> 0.10, `"14"` -> 14.0. Returns `None`
    /// for strings with no leading number.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts
            .next()
            .and_then(|p| p.chars().take_while(char::is_ascii_digit).collect::<String>().parse().ok())
            .unwrap_or(0);
        Some(Self { major, minor })
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

struct FeatureGate {
    dialect: Dialect,
    feature: EngineFeature,
    supported: bool,
    min_version: Option<EngineVersion>,
}

/// The single static capability table (spec'd engine knowledge, not probed).
static FEATURE_GATES: &[FeatureGate] = &[
    FeatureGate {
        dialect: Dialect::DuckDb,
        feature: EngineFeature::Qualify,
        supported: true,
        min_version: Some(EngineVersion::new(0, 9)),
    },
    FeatureGate {
        dialect: Dialect::DuckDb,
        feature: EngineFeature::Pivot,
        supported: true,
        min_version: Some(EngineVersion::new(0, 8)),
    },
    FeatureGate {
        dialect: Dialect::DuckDb,
        feature: EngineFeature::LateralJoin,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::DuckDb,
        feature: EngineFeature::SemiJoinSyntax,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::DuckDb,
        feature: EngineFeature::Tablesample,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Postgres,
        feature: EngineFeature::LateralJoin,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Postgres,
        feature: EngineFeature::Tablesample,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Postgres,
        feature: EngineFeature::MaterializedCte,
        supported: true,
        min_version: Some(EngineVersion::new(12, 0)),
    },
    FeatureGate {
        dialect: Dialect::Snowflake,
        feature: EngineFeature::Qualify,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Snowflake,
        feature: EngineFeature::Pivot,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Snowflake,
        feature: EngineFeature::LateralJoin,
        supported: true,
        min_version: None,
    },
    FeatureGate {
        dialect: Dialect::Snowflake,
        feature: EngineFeature::Tablesample,
        supported: true,
        min_version: None,
    },
];
