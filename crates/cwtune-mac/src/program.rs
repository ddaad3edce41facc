//! Radio programs a node can run.

/// MAC access scheme loaded on the node radios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioProgram {
    /// Contention-based access with random backoff.
    #[cfg_attr(feature = "serde", serde(rename = "CSMA"))]
    Csma,
    /// Time-scheduled access following the loaded slotframe.
    #[cfg_attr(feature = "serde", serde(rename = "TDMA"))]
    Tdma,
}

impl RadioProgram {
    /// Program name as understood by the node agents.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Csma => "CSMA",
            Self::Tdma => "TDMA",
        }
    }

    /// Human-readable access scheme.
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Csma => "contention-based",
            Self::Tdma => "scheduled",
        }
    }
}

impl std::fmt::Display for RadioProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RadioProgram {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CSMA" | "csma" | "contention-based" => Ok(Self::Csma),
            "TDMA" | "tdma" | "scheduled" => Ok(Self::Tdma),
            other => Err(format!("unknown radio program: {}", other)),
        }
    }
}
