//! Upgrade phase catalog.

use std::fmt;

/// Controller(s) a phase acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    Primary,
    Secondary,
    Both,
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// The seven upgrade phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowPhase {
    DisableHa,
    UpgradeSecondary,
    MigrateConfigToSecondary,
    UpgradePrimary,
    MigrateConfigToPrimary,
    ConfigureRouterId,
    EstablishHa,
}

impl WorkflowPhase {
    pub const ALL: [Self; 7] = [
        Self::DisableHa,
        Self::UpgradeSecondary,
        Self::MigrateConfigToSecondary,
        Self::UpgradePrimary,
        Self::MigrateConfigToPrimary,
        Self::ConfigureRouterId,
        Self::EstablishHa,
    ];

    /// 1-based phase number as stored in the checkpoint.
    pub const fn number(self) -> u8 {
        match self {
            Self::DisableHa => 1,
            Self::UpgradeSecondary => 2,
            Self::MigrateConfigToSecondary => 3,
            Self::UpgradePrimary => 4,
            Self::MigrateConfigToPrimary => 5,
            Self::ConfigureRouterId => 6,
            Self::EstablishHa => 7,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.number() == n)
    }

    pub const fn title(self) -> &'static str {
        match self {
            Self::DisableHa => "Disable HA",
            Self::UpgradeSecondary => "Upgrade secondary controller",
            Self::MigrateConfigToSecondary => "Migrate configuration to secondary",
            Self::UpgradePrimary => "Upgrade primary controller",
            Self::MigrateConfigToPrimary => "Migrate configuration to primary",
            Self::ConfigureRouterId => "Configure secondary router ID",
            Self::EstablishHa => "Re-establish HA",
        }
    }

    pub const fn target(self) -> TargetRole {
        match self {
            Self::DisableHa | Self::UpgradePrimary | Self::EstablishHa => TargetRole::Primary,
            Self::UpgradeSecondary | Self::ConfigureRouterId => TargetRole::Secondary,
            Self::MigrateConfigToSecondary | Self::MigrateConfigToPrimary => TargetRole::Both,
        }
    }

    /// Only the configuration migrations need a CyberController Plus license.
    pub const fn requires_license(self) -> bool {
        matches!(
            self,
            Self::MigrateConfigToSecondary | Self::MigrateConfigToPrimary
        )
    }

    /// Phases that transfer a software image and are costly to repeat.
    pub const fn is_software_upgrade(self) -> bool {
        matches!(self, Self::UpgradeSecondary | Self::UpgradePrimary)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {}: {}", self.number(), self.title())
    }
}
