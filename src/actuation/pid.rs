//! PID control law.

/// Gains, limits and running terms of one PID loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PidLaw {
    pub setpoint: Option<f64>,
    /// Half-width of the dead zone around the setpoint; 0 disables it.
    pub band: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integrator_min: f64,
    pub integrator_max: f64,
    /// Nominal period, used as `dt` for the first update.
    pub period: f64,

    pub integrator: f64,
    /// Error from the previous update.
    pub derivator: f64,
    pub error: f64,
    pub p_value: f64,
    pub i_value: f64,
    pub d_value: f64,
    pub control_variable: f64,
    last_update: Option<f64>,
}

impl PidLaw {
    pub fn new(kp: f64, ki: f64, kd: f64, period: f64) -> Self {
        Self {
            setpoint: None,
            band: 0.0,
            kp,
            ki,
            kd,
            integrator_min: f64::NEG_INFINITY,
            integrator_max: f64::INFINITY,
            period,
            integrator: 0.0,
            derivator: 0.0,
            error: 0.0,
            p_value: 0.0,
            i_value: 0.0,
            d_value: 0.0,
            control_variable: 0.0,
            last_update: None,
        }
    }

    /// `(setpoint - band, setpoint + band)` when a band is set.
    pub fn band_bounds(&self) -> Option<(f64, f64)> {
        match self.setpoint {
            Some(sp) if self.band > 0.0 => Some((sp - self.band, sp + self.band)),
            _ => None,
        }
    }

    /// Error with the dead zone applied.
    pub fn band_error(&self, setpoint: f64, measurement: f64) -> f64 {
        let error = setpoint - measurement;
        if self.band > 0.0 && error.abs() <= self.band {
            0.0
        } else {
            error
        }
    }

    /// One step at wall time `now` (epoch seconds). `dt` is the real time since the
    /// previous step. No-op without a setpoint.
    pub fn update(&mut self, measurement: f64, now: f64) -> Option<f64> {
        let setpoint = self.setpoint?;
        let dt = match self.last_update {
            Some(last) if now > last => now - last,
            _ => self.period.max(f64::EPSILON),
        };
        self.last_update = Some(now);

        self.error = self.band_error(setpoint, measurement);
        self.integrator = (self.integrator + self.error * dt).clamp(self.integrator_min, self.integrator_max);
        let derivative = (self.error - self.derivator) / dt;
        self.derivator = self.error;

        self.p_value = self.kp * self.error;
        self.i_value = self.ki * self.integrator;
        self.d_value = self.kd * derivative;
        self.control_variable = self.p_value + self.i_value + self.d_value;
        Some(self.control_variable)
    }

    pub fn set_integrator(&mut self, value: f64) {
        self.integrator = value.clamp(self.integrator_min, self.integrator_max);
    }

    pub fn set_derivator(&mut self, value: f64) {
        self.derivator = value;
    }
}
