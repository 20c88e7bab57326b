// Conversion of physical constants into code units.

/// Newton's constant in cgs.
pub const GRAVITY: f64 = 6.672e-8;
/// 100 km/s/Mpc in 1/s, i.e. H0 in units of h.
pub const HUBBLE: f64 = 3.2407789e-18;
pub const SOLAR_MASS: f64 = 1.989e33;
pub const CM_PER_MPC: f64 = 3.085678e24;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitSystem {
    pub length_in_cm: f64,
    pub mass_in_g: f64,
    pub velocity_in_cm_per_s: f64,
}

impl Default for UnitSystem {
    /// kpc/h, 1e10 Msun/h, km/s.
    fn default() -> Self {
        Self {
            length_in_cm: CM_PER_MPC / 1000.0,
            mass_in_g: 1.0e10 * SOLAR_MASS,
            velocity_in_cm_per_s: 1.0e5,
        }
    }
}

impl UnitSystem {
    pub fn time_in_s(&self) -> f64 {
        self.length_in_cm / self.velocity_in_cm_per_s
    }

    pub fn gravity(&self) -> f64 {
        let t = self.time_in_s();
        GRAVITY / self.length_in_cm.powi(3) * self.mass_in_g * t * t
    }

    pub fn hubble(&self) -> f64 {
        HUBBLE * self.time_in_s()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_units_give_the_usual_code_constants() {
        let units = UnitSystem::default();
        assert_relative_eq!(units.gravity(), 43007.1, max_relative = 1e-4);
        assert_relative_eq!(units.hubble(), 0.1, max_relative = 1e-6);
    }
}
