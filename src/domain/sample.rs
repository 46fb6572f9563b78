use tracing::debug;

/// Magnitude, in raw accelerometer units, at which a reading counts as a swing.
pub const DETECTION_THRESHOLD: f32 = 1500.0;

/// One decoded accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub magnitude: f32,
}

impl SensorSample {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            magnitude: (x * x + y * y + z * z).sqrt(),
        }
    }

    /// Parse an `"x,y,z"` line.
    ///
    /// Never rejects a line: a missing or non-numeric axis reads as `0.0`,
    /// and fields past the third are ignored. Defaulted frames are logged so
    /// a flaky peripheral shows up in the debug log rather than as silent
    /// zero vectors.
    pub fn parse(line: &str) -> Self {
        let mut fields = line.trim().split(',');
        let mut defaulted = 0;
        let mut axis = || match fields.next().and_then(|f| f.trim().parse::<f32>().ok()) {
            Some(value) => value,
            None => {
                defaulted += 1;
                0.0
            }
        };

        let x = axis();
        let y = axis();
        let z = axis();

        if defaulted > 0 {
            debug!(
                "Sensor frame {:?}: {} axis value(s) missing or malformed, defaulted to 0.0",
                line, defaulted
            );
        }

        Self::new(x, y, z)
    }

    /// Whether this reading reaches the swing detection threshold.
    pub fn is_qualifying(&self) -> bool {
        self.magnitude >= DETECTION_THRESHOLD
    }

    pub fn readout(&self) -> String {
        format!(
            "X={:.0} Y={:.0} Z={:.0} | Mag={:.0}",
            self.x, self.y, self.z, self.magnitude
        )
    }
}
