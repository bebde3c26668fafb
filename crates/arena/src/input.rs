use bitflags::bitflags;
use glam::Vec3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        /// Hitscan shot along the aim direction.
        const FIRE = 1 << 0;
        /// Spawns a projectile.
        const THROW = 1 << 1;
    }
}

/// One tick of arena input, three bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaInput {
    pub buttons: Buttons,
    pub move_x: i8,
    pub move_z: i8,
}

impl ArenaInput {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.buttons.bits(), self.move_x as u8, self.move_z as u8]
    }

    /// Unknown button bits are ignored; short payloads are rejected.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match *payload {
            [buttons, x, z, ..] => Some(Self {
                buttons: Buttons::from_bits_truncate(buttons),
                move_x: x as i8,
                move_z: z as i8,
            }),
            _ => None,
        }
    }

    /// Movement direction on the ground plane, at most unit length.
    pub fn direction(&self) -> Vec3 {
        let dir = Vec3::new(self.move_x as f32, 0.0, self.move_z as f32) / i8::MAX as f32;
        dir.clamp_length_max(1.0)
    }

    /// Where shots and throws go: the movement direction, forward when idle.
    pub fn aim(&self) -> Vec3 {
        self.direction().try_normalize().unwrap_or(Vec3::Z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_codec() {
        let input = ArenaInput {
            buttons: Buttons::FIRE | Buttons::THROW,
            move_x: -127,
            move_z: 64,
        };
        assert_eq!(ArenaInput::decode(&input.encode()), Some(input));
        assert_eq!(ArenaInput::decode(&[1, 2]), None);
        assert_eq!(ArenaInput::decode(&[0xFF, 0, 0]).unwrap().buttons, Buttons::all());
    }

    #[test]
    fn test_aim_defaults_forward() {
        assert_eq!(ArenaInput::default().aim(), Vec3::Z);
        let diagonal = ArenaInput {
            move_x: 127,
            move_z: 127,
            ..Default::default()
        };
        assert!((diagonal.direction().length() - 1.0).abs() < 1e-5);
    }
}
