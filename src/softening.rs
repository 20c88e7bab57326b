use crate::{settings::SofteningSettings, shared::ParticleType};

/// Ratio of the spline kernel support to the Plummer-equivalent softening.
pub const SPLINE_SUPPORT: f64 = 2.8;

/// Comoving softening per particle type for one force pass.
///
/// `softening` is the Plummer-equivalent length, `force_softening` the support
/// radius `h` of the spline kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct SofteningTable {
    table: [f64; ParticleType::COUNT],
    force: [f64; ParticleType::COUNT],
}

impl SofteningTable {
    /// Caps each comoving softening so its physical size `soft * time` stays below `max_physical`.
    pub fn new(settings: &SofteningSettings, time: f64) -> Self {
        let mut table = [0.0; ParticleType::COUNT];
        for t in ParticleType::ALL {
            let i = t.index();
            table[i] = if settings.comoving[i] * time > settings.max_physical[i] {
                settings.max_physical[i] / time
            } else {
                settings.comoving[i]
            };
        }
        Self {
            table,
            force: table.map(|s| SPLINE_SUPPORT * s),
        }
    }

    pub fn softening(&self, ptype: ParticleType) -> f64 {
        self.table[ptype.index()]
    }

    pub fn force_softening(&self, ptype: ParticleType) -> f64 {
        self.force[ptype.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_cap_applies_at_late_times() {
        let mut settings = SofteningSettings::uniform(0.1);
        settings.max_physical[ParticleType::Halo.index()] = 0.05;
        let early = SofteningTable::new(&settings, 0.25);
        let late = SofteningTable::new(&settings, 1.0);

        assert_eq!(early.softening(ParticleType::Halo), 0.1);
        assert!((late.softening(ParticleType::Halo) - 0.05).abs() < 1e-15);
        assert_eq!(late.softening(ParticleType::Gas), 0.1);
    }

    #[test]
    fn force_softening_is_spline_support() {
        let table = SofteningTable::new(&SofteningSettings::uniform(0.5), 1.0);
        for t in ParticleType::ALL {
            assert!((table.force_softening(t) - 1.4).abs() < 1e-12);
        }
    }
}
