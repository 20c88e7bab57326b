use std::f64::consts::PI;

use crate::{settings::GravitySettings, shared::GravParticle, softening::SofteningTable};

/// Potential of the uniform background a periodic mesh removes, per `m^(2/3) rho^(1/3)`.
pub const BACKGROUND_POTENTIAL_COEFF: f64 = 2.8372975;

/// Turns the raw tree sums of a particle into its final acceleration and potential.
#[derive(Clone, Debug, PartialEq)]
pub struct GravityPostProcess {
    g: f64,
    softening: SofteningTable,
    /// Mean matter density, present when the background correction applies.
    background_density: Option<f64>,
}

impl GravityPostProcess {
    pub fn new(settings: &GravitySettings, softening: SofteningTable) -> Self {
        let background_density = (settings.periodic && settings.background_correction).then(|| {
            settings.omega0 * 3.0 * settings.hubble * settings.hubble / (8.0 * PI * settings.g)
        });
        Self {
            g: settings.g,
            softening,
            background_density,
        }
    }

    pub fn apply(&self, p: &mut GravParticle) {
        let total = p.grav_accel + p.grav_pm / self.g;
        p.old_acc = total.norm();

        p.grav_accel *= self.g;
        p.total_accel = p.grav_accel + p.grav_pm;

        // The walk includes the particle itself.
        p.potential += p.mass / self.softening.softening(p.ptype);

        if let Some(rho) = self.background_density {
            p.potential -=
                BACKGROUND_POTENTIAL_COEFF * p.mass.powf(2.0 / 3.0) * rho.powf(1.0 / 3.0);
        }

        p.potential *= self.g;
        p.potential += p.pm_potential;
    }
}
