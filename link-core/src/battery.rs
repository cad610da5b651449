// Battery voltage policy: averaged 12-bit ADC samples behind a resistor divider

pub const NUM_SAMPLES: usize = 10;

/// Synchronous battery sampling as consumed by the application loop.
pub trait VoltageSource {
    fn read_voltage(&mut self) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryDivider {
    /// Upper resistor (ohms)
    pub r1: f32,
    /// Lower resistor (ohms)
    pub r2: f32,
    pub adc_max: f32,
    pub adc_ref_voltage: f32,
}

impl Default for BatteryDivider {
    fn default() -> Self {
        Self {
            r1: 51_000.0,
            r2: 10_000.0,
            adc_max: 4095.0,
            adc_ref_voltage: 3.3,
        }
    }
}

impl BatteryDivider {
    pub fn ratio(&self) -> f32 {
        (self.r1 + self.r2) / self.r2
    }

    pub fn pin_voltage(&self, raw: u16) -> f32 {
        (raw as f32 / self.adc_max) * self.adc_ref_voltage
    }

    pub fn battery_voltage(&self, raw: u16) -> f32 {
        self.pin_voltage(raw) * self.ratio()
    }

    /// Mean of the samples converted to battery volts. Empty input reads as 0 V.
    pub fn average_voltage(&self, samples: &[u16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: u32 = samples.iter().map(|&s| s as u32).sum();
        let mean = sum as f32 / samples.len() as f32;
        (mean / self.adc_max) * self.adc_ref_voltage * self.ratio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_full_scale_reading() {
        let divider = BatteryDivider::default();
        assert!(close(divider.pin_voltage(4095), 3.3));
        assert!(close(divider.battery_voltage(4095), 3.3 * 6.1));
    }

    #[test]
    fn test_divider_ratio() {
        assert!(close(BatteryDivider::default().ratio(), 6.1));
    }

    #[test]
    fn test_average_of_samples() {
        let divider = BatteryDivider::default();
        let samples = [2000u16, 2100, 2200];
        let expected = divider.battery_voltage(2100);
        assert!(close(divider.average_voltage(&samples), expected));
        assert_eq!(divider.average_voltage(&[]), 0.0);
    }
}
