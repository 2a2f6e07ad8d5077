/// Single-axis recursive estimator, one instance per latitude/longitude.
///
/// Velocity stays at zero and is never re-estimated from residuals, so this
/// tracks a constant position with process noise rather than a full
/// constant-velocity model.
#[derive(Clone, Debug)]
pub struct ScalarKalmanFilter {
    position: Option<f64>,
    velocity: f64,
    position_error: f64,
    velocity_error: f64,
    process_noise: f64,
    measurement_noise: f64,
}

impl ScalarKalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            position: None,
            velocity: 0.0,
            position_error: measurement_noise,
            velocity_error: 0.0,
            process_noise,
            measurement_noise,
        }
    }

    /// Feed one measurement. Returns the filtered position, or the input
    /// untouched while uninitialized and the input is absent or exactly zero.
    pub fn update(&mut self, measurement: Option<f64>, dt: f64) -> Option<f64> {
        let Some(position) = self.position else {
            return match measurement {
                Some(m) if m != 0.0 => {
                    self.position = Some(m);
                    self.position_error = self.measurement_noise;
                    Some(m)
                }
                other => other,
            };
        };

        let Some(m) = measurement else {
            return Some(position);
        };

        // Predict
        let predicted = position + self.velocity * dt;
        let predicted_error = self.position_error + self.velocity_error * dt * dt + self.process_noise;

        // Correct
        let gain = predicted_error / (predicted_error + self.measurement_noise);
        let corrected = predicted + gain * (m - predicted);
        self.position_error = (predicted_error * (1.0 - gain)).max(0.0);
        self.position = Some(corrected);

        Some(corrected)
    }

    /// Callers set this before `update` on every tick: one filter instance is
    /// shared across source kinds with different trust levels.
    pub fn set_measurement_noise(&mut self, noise: f64) {
        self.measurement_noise = noise.max(0.0);
    }

    /// Force a new trusted position, discarding prior state.
    pub fn reset(&mut self, position: f64) {
        self.position = Some(position);
        self.position_error = self.measurement_noise;
    }

    pub fn is_initialized(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<f64> {
        self.position
    }

    pub fn position_error(&self) -> f64 {
        self.position_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uninitialized_passes_through_missing_and_zero() {
        let mut filter = ScalarKalmanFilter::new(1e-4, 1e-2);

        assert_eq!(filter.update(None, 1.0), None);
        assert!(!filter.is_initialized());

        assert_eq!(filter.update(Some(0.0), 1.0), Some(0.0));
        assert!(!filter.is_initialized());
    }

    #[test]
    fn test_first_measurement_initializes() {
        let mut filter = ScalarKalmanFilter::new(1e-4, 1e-2);
        assert_eq!(filter.update(Some(37.77), 1.0), Some(37.77));
        assert!(filter.is_initialized());
        assert_eq!(filter.position_error(), 1e-2);
    }

    #[test]
    fn test_repeated_measurement_converges_error() {
        let mut filter = ScalarKalmanFilter::new(1e-6, 1e-2);
        filter.update(Some(12.5), 1.0);

        let mut last_error = filter.position_error();
        for _ in 0..20 {
            let out = filter.update(Some(12.5), 1.0).unwrap();
            assert_relative_eq!(out, 12.5, max_relative = 1e-12);
            let err = filter.position_error();
            assert!(err <= last_error);
            assert!(err >= 0.0);
            last_error = err;
        }

        // Strictly decreasing at the start, before the floor is reached
        let mut fresh = ScalarKalmanFilter::new(1e-6, 1e-2);
        fresh.update(Some(12.5), 1.0);
        let e0 = fresh.position_error();
        fresh.update(Some(12.5), 1.0);
        let e1 = fresh.position_error();
        fresh.update(Some(12.5), 1.0);
        let e2 = fresh.position_error();
        assert!(e1 < e0 && e2 < e1);
    }

    #[test]
    fn test_update_moves_toward_measurement() {
        let mut filter = ScalarKalmanFilter::new(1e-4, 1.0);
        filter.update(Some(10.0), 1.0);
        let out = filter.update(Some(11.0), 1.0).unwrap();
        assert!(out > 10.0 && out < 11.0);
    }

    #[test]
    fn test_lower_noise_trusts_measurement_more() {
        let mut trusted = ScalarKalmanFilter::new(1e-4, 1.0);
        let mut coarse = ScalarKalmanFilter::new(1e-4, 1.0);
        trusted.update(Some(10.0), 1.0);
        coarse.update(Some(10.0), 1.0);

        trusted.set_measurement_noise(0.01);
        coarse.set_measurement_noise(100.0);
        let a = trusted.update(Some(11.0), 1.0).unwrap();
        let b = coarse.update(Some(11.0), 1.0).unwrap();
        assert!(a > b);
    }

    #[test]
    fn test_zero_after_init_is_a_measurement() {
        let mut filter = ScalarKalmanFilter::new(1e-4, 1.0);
        filter.update(Some(0.5), 1.0);
        let out = filter.update(Some(0.0), 1.0).unwrap();
        assert!(out < 0.5);
    }

    #[test]
    fn test_reset_forces_position() {
        let mut filter = ScalarKalmanFilter::new(1e-4, 0.5);
        filter.update(Some(1.0), 1.0);
        filter.update(Some(1.2), 1.0);
        filter.reset(50.0);
        assert_eq!(filter.position(), Some(50.0));
        assert_eq!(filter.position_error(), 0.5);
    }
}
