use crate::capture_session::{CaptureSession, ConfigError, TriggerType};

pub trait TriggerConfig {
    /// Write the trigger fields of `session`.
    fn apply_to(&self, session: &mut CaptureSession);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTriggerBehavior {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeTrigger {
    pub channel: u8,
    pub behavior: EdgeTriggerBehavior,
    /// Sample at the blast rate; only valid without pre-trigger samples.
    pub blast: bool,
}

impl EdgeTrigger {
    pub fn on(channel: u8) -> EdgeTriggerBuilder {
        EdgeTriggerBuilder { channel }
    }
}

#[derive(Debug)]
pub struct EdgeTriggerBuilder {
    channel: u8,
}

impl EdgeTriggerBuilder {
    pub fn rising_edge(self) -> EdgeTrigger {
        EdgeTrigger {
            channel: self.channel,
            behavior: EdgeTriggerBehavior::Rising,
            blast: false,
        }
    }

    pub fn falling_edge(self) -> EdgeTrigger {
        EdgeTrigger {
            channel: self.channel,
            behavior: EdgeTriggerBehavior::Falling,
            blast: false,
        }
    }
}

impl EdgeTrigger {
    pub fn blast(mut self) -> Self {
        self.blast = true;
        self
    }
}

impl TriggerConfig for EdgeTrigger {
    fn apply_to(&self, session: &mut CaptureSession) {
        session.trigger_type = if self.blast { TriggerType::Blast } else { TriggerType::Edge };
        session.trigger_channel = self.channel;
        session.trigger_inverted = self.behavior == EdgeTriggerBehavior::Falling;
        session.trigger_pattern = 0;
        session.trigger_bit_count = 0;
    }
}

/// Collects the expected level of consecutive channels starting at
/// `first_channel`.
#[derive(Debug)]
pub struct PatternTriggerBuilder {
    first_channel: u8,
    bit_states: Vec<BitState>,
}

impl PatternTriggerBuilder {
    pub fn new(first_channel: u8) -> Self {
        Self {
            first_channel,
            bit_states: Vec::new(),
        }
    }

    pub fn bit(mut self, state: BitState) -> Self {
        self.bit_states.push(state);
        self
    }

    pub fn bits(mut self, states: &[BitState]) -> Self {
        self.bit_states.extend_from_slice(states);
        self
    }

    /// Complex trigger: up to 16 bits, evaluated by the state machine engine.
    pub fn matches(self) -> Result<PatternTrigger, ConfigError> {
        self.build(TriggerType::Complex)
    }

    /// Fast trigger: up to 5 bits, evaluated every sample clock.
    pub fn matches_fast(self) -> Result<PatternTrigger, ConfigError> {
        self.build(TriggerType::Fast)
    }

    fn build(self, trigger_type: TriggerType) -> Result<PatternTrigger, ConfigError> {
        let max = trigger_type.max_pattern_bits().unwrap_or(0);
        let count = self.bit_states.len();
        if count == 0 || count > usize::from(max) {
            return Err(ConfigError::TriggerBitCount {
                count: count.min(usize::from(u8::MAX)) as u8,
                max,
            });
        }

        let mut pattern = 0u16;
        for (i, state) in self.bit_states.iter().enumerate() {
            if *state == BitState::High {
                pattern |= 1 << i;
            }
        }

        Ok(PatternTrigger {
            trigger_type,
            first_channel: self.first_channel,
            pattern,
            bit_count: count as u8,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternTrigger {
    pub trigger_type: TriggerType,
    pub first_channel: u8,
    pub pattern: u16,
    pub bit_count: u8,
}

impl PatternTrigger {
    pub fn start_capturing_when(first_channel: u8) -> PatternTriggerBuilder {
        PatternTriggerBuilder::new(first_channel)
    }
}

impl TriggerConfig for PatternTrigger {
    fn apply_to(&self, session: &mut CaptureSession) {
        session.trigger_type = self.trigger_type;
        session.trigger_channel = self.first_channel;
        session.trigger_inverted = false;
        session.trigger_pattern = self.pattern;
        session.trigger_bit_count = self.bit_count;
    }
}

/// Either kind of trigger, for APIs that accept both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge(EdgeTrigger),
    Pattern(PatternTrigger),
}

impl From<EdgeTrigger> for Trigger {
    fn from(trigger: EdgeTrigger) -> Self {
        Self::Edge(trigger)
    }
}

impl From<PatternTrigger> for Trigger {
    fn from(trigger: PatternTrigger) -> Self {
        Self::Pattern(trigger)
    }
}

impl TriggerConfig for Trigger {
    fn apply_to(&self, session: &mut CaptureSession) {
        match self {
            Self::Edge(trigger) => trigger.apply_to(session),
            Self::Pattern(trigger) => trigger.apply_to(session),
        }
    }
}

impl CaptureSession {
    pub fn with_trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        trigger.into().apply_to(&mut self);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_trigger() {
        let session = CaptureSession::new(1_000_000, 10, 90)
            .with_channels(&[0, 3])
            .with_trigger(EdgeTrigger::on(3).falling_edge());
        assert_eq!(session.trigger_type, TriggerType::Edge);
        assert_eq!(session.trigger_channel, 3);
        assert!(session.trigger_inverted);

        let blast = CaptureSession::new(1_000_000, 0, 90).with_trigger(EdgeTrigger::on(1).rising_edge().blast());
        assert_eq!(blast.trigger_type, TriggerType::Blast);
        assert!(!blast.trigger_inverted);
    }

    #[test]
    fn test_pattern_trigger() {
        let trigger = PatternTrigger::start_capturing_when(2)
            .bit(BitState::High)
            .bit(BitState::Low)
            .bit(BitState::High)
            .matches()
            .unwrap();
        assert_eq!(trigger.pattern, 0b101);
        assert_eq!(trigger.bit_count, 3);

        let session = CaptureSession::new(1_000_000, 10, 90).with_trigger(trigger);
        assert_eq!(session.trigger_type, TriggerType::Complex);
        assert_eq!(session.trigger_channel, 2);
        assert_eq!(session.trigger_pattern, 0b101);
        assert_eq!(session.trigger_bit_count, 3);
    }

    #[test]
    fn test_pattern_width_limits() {
        let too_wide = PatternTrigger::start_capturing_when(0)
            .bits(&[BitState::Low; 6])
            .matches_fast();
        assert_eq!(too_wide, Err(ConfigError::TriggerBitCount { count: 6, max: 5 }));

        let empty = PatternTrigger::start_capturing_when(0).matches();
        assert!(empty.is_err());

        let widest = PatternTrigger::start_capturing_when(0)
            .bits(&[BitState::High; 16])
            .matches()
            .unwrap();
        assert_eq!(widest.pattern, 0xFFFF);
    }
}
