// sense-preprocess/src/transform.rs
//! 2-D affine transforms for presenting frames upright.
//!
//! Convention: a point `(x, y)` maps to
//! `(a·x + c·y + tx, b·x + d·y + ty)` in y-down display coordinates,
//! so a positive quarter turn is clockwise on screen.

use sense_camera::{CameraFacing, Rotation};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Clockwise rotation by `turns` × 90°. Exact, no trig.
    pub fn quarter_turns(turns: u8) -> Self {
        let (cos, sin) = match turns % 4 {
            0 => (1.0, 0.0),
            1 => (0.0, 1.0),
            2 => (-1.0, 0.0),
            _ => (0.0, -1.0),
        };
        AffineTransform { a: cos, b: sin, c: -sin, d: cos, tx: 0.0, ty: 0.0 }
    }

    /// Flip left/right around the vertical axis.
    pub fn mirrored() -> Self {
        AffineTransform { a: -1.0, ..Self::IDENTITY }
    }

    /// `self` first, then `next`.
    pub fn then(&self, next: &AffineTransform) -> Self {
        AffineTransform {
            a: self.a * next.a + self.b * next.c,
            b: self.a * next.b + self.b * next.d,
            c: self.c * next.a + self.d * next.c,
            d: self.c * next.b + self.d * next.d,
            tx: self.tx * next.a + self.ty * next.c + next.tx,
            ty: self.tx * next.b + self.ty * next.d + next.ty,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

/// Transform that turns a sensor-oriented frame into what the user expects:
/// rotated upright, and mirrored when the lens faces them.
pub fn orientation_transform(rotation: Rotation, facing: CameraFacing) -> AffineTransform {
    let upright = AffineTransform::quarter_turns(rotation.quarter_turns());
    match facing {
        CameraFacing::Back => upright,
        CameraFacing::Front => upright.then(&AffineTransform::mirrored()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(p: (f32, f32), q: (f32, f32)) -> bool {
        (p.0 - q.0).abs() < 1e-6 && (p.1 - q.1).abs() < 1e-6
    }

    #[test]
    fn back_camera_upright_sensor_is_identity() {
        assert!(orientation_transform(Rotation::Deg0, CameraFacing::Back).is_identity());
    }

    #[test]
    fn front_camera_is_mirrored() {
        let t = orientation_transform(Rotation::Deg0, CameraFacing::Front);
        assert!(close(t.apply(3.0, 2.0), (-3.0, 2.0)));
    }

    #[test]
    fn quarter_turn_is_clockwise_on_screen() {
        // +x (right) goes to +y (down)
        let t = orientation_transform(Rotation::Deg90, CameraFacing::Back);
        assert!(close(t.apply(1.0, 0.0), (0.0, 1.0)));
        let four = (0..4).fold(AffineTransform::IDENTITY, |acc, _| {
            acc.then(&AffineTransform::quarter_turns(1))
        });
        assert!(four.is_identity());
    }

    #[test]
    fn front_camera_rotates_then_mirrors() {
        let t = orientation_transform(Rotation::Deg90, CameraFacing::Front);
        assert!(close(t.apply(1.0, 0.0), (0.0, 1.0)));
        assert!(close(t.apply(0.0, 1.0), (1.0, 0.0)));
    }

    #[test]
    fn then_composes_translation() {
        let shift = AffineTransform { tx: 5.0, ..AffineTransform::IDENTITY };
        let t = shift.then(&AffineTransform::mirrored());
        assert!(close(t.apply(1.0, 1.0), (-6.0, 1.0)));
    }
}
