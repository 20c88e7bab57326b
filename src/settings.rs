use crate::{
    error::{GravityError, Result},
    shared::{ParticleType, PeriodicBox},
    units::UnitSystem,
};

/// Which opening criterion the force computation is configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OpeningCriterionKind {
    /// Barnes-Hut: open when len > r * theta.
    Geometric,
    /// Open when the estimated force error exceeds a fraction of the previous acceleration.
    Relative,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SofteningSettings {
    /// Comoving softening per particle type.
    pub comoving: [f64; ParticleType::COUNT],
    /// Cap on the physical softening per particle type.
    pub max_physical: [f64; ParticleType::COUNT],
    /// Gas uses its own smoothing length as softening.
    pub adaptive_gas: bool,
}

impl Default for SofteningSettings {
    fn default() -> Self {
        Self {
            comoving: [0.01; ParticleType::COUNT],
            max_physical: [0.01; ParticleType::COUNT],
            adaptive_gas: false,
        }
    }
}

impl SofteningSettings {
    pub fn uniform(softening: f64) -> Self {
        Self {
            comoving: [softening; ParticleType::COUNT],
            max_physical: [softening; ParticleType::COUNT],
            adaptive_gas: false,
        }
    }
}

/// Parameters of the short-range/long-range force split.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShortRangeSettings {
    pub pm_grid: usize,
    /// Split scale in mesh cells.
    pub asmth: f64,
    /// Tree cutoff radius in units of the split scale.
    pub rcut: f64,
}

impl Default for ShortRangeSettings {
    fn default() -> Self {
        Self {
            pm_grid: 128,
            asmth: 1.25,
            rcut: 4.5,
        }
    }
}

impl ShortRangeSettings {
    pub fn smoothing_scale(&self, box_size: f64) -> f64 {
        self.asmth * box_size / self.pm_grid as f64
    }

    pub fn cutoff_radius(&self, box_size: f64) -> f64 {
        self.rcut * self.smoothing_scale(box_size)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GravitySettings {
    pub theta: f64,
    pub err_tol_force_acc: f64,
    pub opening: OpeningCriterionKind,
    pub softening: SofteningSettings,
    /// `None` computes the full Newtonian force with the tree alone.
    pub short_range: Option<ShortRangeSettings>,
    pub g: f64,
    pub box_size: f64,
    pub periodic: bool,
    pub background_correction: bool,
    pub omega0: f64,
    pub hubble: f64,
    /// Scale factor, bounds the comoving softening through `max_physical`.
    pub time: f64,
    /// Export records a rank may queue per communication round.
    pub export_buffer_size: usize,
}

impl Default for GravitySettings {
    fn default() -> Self {
        Self {
            theta: 0.5,
            err_tol_force_acc: 0.005,
            opening: OpeningCriterionKind::Geometric,
            softening: SofteningSettings::default(),
            short_range: None,
            g: 1.0,
            box_size: 1.0,
            periodic: false,
            background_correction: false,
            omega0: 1.0,
            hubble: 0.1,
            time: 1.0,
            export_buffer_size: 4096,
        }
    }
}

impl GravitySettings {
    pub fn periodic_box(&self) -> PeriodicBox {
        if self.periodic {
            PeriodicBox::new(self.box_size, true)
        } else {
            PeriodicBox::open()
        }
    }

    /// Takes `g` and the Hubble rate from a unit system instead of unit values.
    pub fn with_units(self, units: &UnitSystem) -> Self {
        Self {
            g: units.gravity(),
            hubble: units.hubble(),
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(GravityError::InvalidSettings(msg.into()))
        }

        if !(self.theta >= 0.0 && self.theta.is_finite()) {
            return invalid(format!("opening angle must be finite and >= 0, got {}", self.theta));
        }
        if self.opening == OpeningCriterionKind::Relative && !(self.err_tol_force_acc > 0.0) {
            return invalid(format!(
                "relative criterion needs a positive error tolerance, got {}",
                self.err_tol_force_acc
            ));
        }
        if !(self.g > 0.0) {
            return invalid(format!("gravitational constant must be positive, got {}", self.g));
        }
        if !(self.time > 0.0) {
            return invalid(format!("scale factor must be positive, got {}", self.time));
        }
        if self.export_buffer_size == 0 {
            return invalid("export buffer must hold at least one record");
        }
        if (self.periodic || self.short_range.is_some()) && !(self.box_size > 0.0) {
            return invalid(format!("box size must be positive, got {}", self.box_size));
        }
        for t in ParticleType::ALL {
            let (soft, cap) = (
                self.softening.comoving[t.index()],
                self.softening.max_physical[t.index()],
            );
            if !(soft > 0.0 && cap > 0.0) {
                return invalid(format!(
                    "softening of {t:?} must be positive, got {soft} (cap {cap})"
                ));
            }
        }
        if let Some(split) = &self.short_range {
            if split.pm_grid == 0 || !(split.asmth > 0.0) || !(split.rcut > 0.0) {
                return invalid(format!("bad short-range split {split:?}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GravitySettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_softening() {
        let mut settings = GravitySettings::default();
        settings.softening.comoving[ParticleType::Star.index()] = 0.0;
        assert!(matches!(settings.validate(), Err(GravityError::InvalidSettings(_))));
    }

    #[test]
    fn rejects_empty_export_buffer() {
        let settings = GravitySettings {
            export_buffer_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unit_system_sets_code_constants() {
        let settings = GravitySettings::default().with_units(&UnitSystem::default());
        assert!((settings.g - 43007.1).abs() < 5.0);
        assert!((settings.hubble - 0.1).abs() < 1e-6);
        assert_eq!(settings.theta, 0.5);
    }

    #[test]
    fn cutoff_radius_scales_with_mesh() {
        let split = ShortRangeSettings {
            pm_grid: 64,
            asmth: 1.25,
            rcut: 4.5,
        };
        assert!((split.smoothing_scale(64.0) - 1.25).abs() < 1e-12);
        assert!((split.cutoff_radius(64.0) - 5.625).abs() < 1e-12);
    }
}
