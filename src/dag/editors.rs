use cgmath::Vector3;

use crate::dag::config::NodeConfig;
use crate::dag::coord::NodeCoord;
use crate::dag::edit::{EditDecision, Editor, VBREditor};
use crate::dag::pointer::NodePointer;
use crate::dag::vbr::VBRColor;

/// Fills an axis-aligned box `[min, max)` with a color.
#[derive(Clone, Debug)]
pub struct AabbEditor {
    pub min: Vector3<u32>,
    pub max: Vector3<u32>,
    pub color: VBRColor,
}

impl AabbEditor {
    fn voxel_in_range(&self, pos: Vector3<u32>) -> bool {
        pos.x >= self.min.x
            && pos.y >= self.min.y
            && pos.z >= self.min.z
            && pos.x < self.max.x
            && pos.y < self.max.y
            && pos.z < self.max.z
    }
}

impl Editor for AabbEditor {
    fn edit_node(&self, config: &NodeConfig, coord: NodeCoord, _ptr: NodePointer) -> EditDecision {
        let lb = coord.lower_bound_at(config.voxel_level());
        let ub = coord.upper_bound_at(config.voxel_level());
        if ub.x <= self.min.x
            || ub.y <= self.min.y
            || ub.z <= self.min.z
            || lb.x >= self.max.x
            || lb.y >= self.max.y
            || lb.z >= self.max.z
        {
            return EditDecision::Unaffected;
        }
        if lb.x >= self.min.x
            && lb.y >= self.min.y
            && lb.z >= self.min.z
            && ub.x <= self.max.x
            && ub.y <= self.max.y
            && ub.z <= self.max.z
        {
            return EditDecision::Fill;
        }
        EditDecision::Proceed
    }

    fn edit_voxel(&self, _config: &NodeConfig, coord: NodeCoord, voxel: bool) -> bool {
        voxel || self.voxel_in_range(coord.pos)
    }
}

impl VBREditor for AabbEditor {
    fn edit_node_color(
        &self,
        config: &NodeConfig,
        coord: NodeCoord,
        ptr: NodePointer,
        color: &mut Option<VBRColor>,
    ) -> EditDecision {
        let decision = self.edit_node(config, coord, ptr);
        if decision == EditDecision::Fill || ptr.is_null() || *color == Some(self.color) {
            *color = Some(self.color);
        } else {
            *color = None;
        }
        decision
    }

    fn edit_voxel_color(
        &self,
        _config: &NodeConfig,
        coord: NodeCoord,
        voxel: bool,
        color: &mut VBRColor,
    ) -> bool {
        let in_range = self.voxel_in_range(coord.pos);
        if in_range || !voxel {
            *color = self.color;
        }
        voxel || in_range
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SphereMode {
    /// Occupy every voxel inside the sphere.
    Fill,
    /// Clear every voxel inside the sphere; geometry-only.
    Dig,
    /// Recolor occupied voxels inside the sphere, occupancy untouched.
    Paint,
}

/// Spherical fill / dig / paint brush. Subtrees are classified by the exact
/// minimum and maximum squared distance between their cube and the center.
#[derive(Clone, Debug)]
pub struct SphereEditor {
    pub mode: SphereMode,
    pub center: Vector3<u32>,
    /// Squared radius, in voxels.
    pub radius2: u64,
    pub color: VBRColor,
}

impl SphereEditor {
    pub fn fill(center: Vector3<u32>, radius: u32, color: VBRColor) -> Self {
        SphereEditor {
            mode: SphereMode::Fill,
            center,
            radius2: (radius as u64) * (radius as u64),
            color,
        }
    }

    pub fn dig(center: Vector3<u32>, radius: u32) -> Self {
        SphereEditor {
            mode: SphereMode::Dig,
            center,
            radius2: (radius as u64) * (radius as u64),
            color: VBRColor::solid(Default::default()),
        }
    }

    pub fn paint(center: Vector3<u32>, radius: u32, color: VBRColor) -> Self {
        SphereEditor {
            mode: SphereMode::Paint,
            center,
            radius2: (radius as u64) * (radius as u64),
            color,
        }
    }

    /// Minimum and maximum squared distance from the cube `[lb, ub)` to the
    /// center. The maximum conservatively uses the exclusive corner.
    fn distance_bounds(&self, lb: Vector3<u32>, ub: Vector3<u32>) -> (u64, u64) {
        let mut min_n2 = 0u64;
        let mut max_n2 = 0u64;
        for axis in 0..3 {
            let (lb, ub, center) = match axis {
                0 => (lb.x, ub.x, self.center.x),
                1 => (lb.y, ub.y, self.center.y),
                _ => (lb.z, ub.z, self.center.z),
            };
            let lb_dist = lb as i64 - center as i64;
            let ub_dist = ub as i64 - center as i64;
            let lb_dist2 = (lb_dist * lb_dist) as u64;
            let ub_dist2 = (ub_dist * ub_dist) as u64;
            max_n2 += lb_dist2.max(ub_dist2);
            if lb_dist > 0 {
                min_n2 += lb_dist2;
            }
            if ub_dist < 0 {
                min_n2 += ub_dist2;
            }
        }
        (min_n2, max_n2)
    }

    fn voxel_in_range(&self, pos: Vector3<u32>) -> bool {
        let d = Vector3::new(
            pos.x as i64 - self.center.x as i64,
            pos.y as i64 - self.center.y as i64,
            pos.z as i64 - self.center.z as i64,
        );
        (d.x * d.x + d.y * d.y + d.z * d.z) as u64 <= self.radius2
    }
}

impl Editor for SphereEditor {
    fn edit_node(&self, config: &NodeConfig, coord: NodeCoord, _ptr: NodePointer) -> EditDecision {
        let lb = coord.lower_bound_at(config.voxel_level());
        let ub = coord.upper_bound_at(config.voxel_level());
        let (min_n2, max_n2) = self.distance_bounds(lb, ub);
        if max_n2 <= self.radius2 {
            return match self.mode {
                SphereMode::Dig => EditDecision::Clear,
                _ => EditDecision::Fill,
            };
        }
        if min_n2 > self.radius2 {
            EditDecision::Unaffected
        } else {
            EditDecision::Proceed
        }
    }

    fn edit_voxel(&self, _config: &NodeConfig, coord: NodeCoord, voxel: bool) -> bool {
        match self.mode {
            SphereMode::Paint => voxel,
            SphereMode::Fill => voxel || self.voxel_in_range(coord.pos),
            SphereMode::Dig => voxel && !self.voxel_in_range(coord.pos),
        }
    }
}

impl VBREditor for SphereEditor {
    fn edit_node_color(
        &self,
        config: &NodeConfig,
        coord: NodeCoord,
        ptr: NodePointer,
        color: &mut Option<VBRColor>,
    ) -> EditDecision {
        // digging never threads colors; submit it as a plain edit
        debug_assert!(self.mode != SphereMode::Dig);

        let mut decision = self.edit_node(config, coord, ptr);
        if decision == EditDecision::Fill {
            *color = Some(self.color);
            if self.mode == SphereMode::Paint {
                decision = EditDecision::Unaffected;
            }
        } else if ptr.is_null() || *color == Some(self.color) {
            *color = Some(self.color);
        } else {
            *color = None;
        }
        if self.mode == SphereMode::Paint && ptr.is_null() {
            decision = EditDecision::Unaffected;
        }
        decision
    }

    fn edit_voxel_color(
        &self,
        _config: &NodeConfig,
        coord: NodeCoord,
        voxel: bool,
        color: &mut VBRColor,
    ) -> bool {
        debug_assert!(self.mode != SphereMode::Dig);

        let in_range = self.voxel_in_range(coord.pos);
        if in_range || !voxel {
            *color = self.color;
        }
        match self.mode {
            SphereMode::Fill => voxel || in_range,
            _ => voxel,
        }
    }
}

#[cfg(test)]
mod editor_tests {
    use super::*;
    use crate::dag::tests::small_config;
    use crate::dag::vbr::RGB8Color;

    fn red() -> VBRColor {
        VBRColor::solid(RGB8Color(0xFF0000))
    }

    #[test]
    fn aabb_classification() {
        let config = small_config();
        let editor = AabbEditor {
            min: Vector3::new(0, 0, 0),
            max: Vector3::new(8, 8, 8),
            color: red(),
        };

        let root = NodeCoord::root();
        assert_eq!(editor.edit_node(&config, root, NodePointer::NULL), EditDecision::Proceed);
        // level-1 child (0,0,0) spans [0,8)^3: fully inside
        assert_eq!(
            editor.edit_node(&config, root.child(0), NodePointer::NULL),
            EditDecision::Fill
        );
        // level-1 child (1,1,1) spans [8,16)^3: disjoint
        assert_eq!(
            editor.edit_node(&config, root.child(7), NodePointer::NULL),
            EditDecision::Unaffected
        );
    }

    #[test]
    fn sphere_classification() {
        let config = small_config();
        let editor = SphereEditor::fill(Vector3::new(8, 8, 8), 5, red());

        let root = NodeCoord::root();
        assert_eq!(editor.edit_node(&config, root, NodePointer::NULL), EditDecision::Proceed);

        // the 2-wide cube at the center is fully inside radius 5
        let center_cube = NodeCoord {
            level: 3,
            pos: Vector3::new(4, 4, 4),
        };
        assert_eq!(
            editor.edit_node(&config, center_cube, NodePointer::NULL),
            EditDecision::Fill
        );

        // a corner cube is fully outside
        let corner = NodeCoord {
            level: 2,
            pos: Vector3::new(0, 0, 0),
        };
        assert_eq!(
            editor.edit_node(&config, corner, NodePointer::NULL),
            EditDecision::Unaffected
        );

        let dig = SphereEditor::dig(Vector3::new(8, 8, 8), 5);
        assert_eq!(dig.edit_node(&config, center_cube, NodePointer::NULL), EditDecision::Clear);
    }

    #[test]
    fn paint_touches_colors_only() {
        let config = small_config();
        let editor = SphereEditor::paint(Vector3::new(8, 8, 8), 8, red());

        // occupancy never changes
        let inside = NodeCoord::voxel(4, Vector3::new(8, 8, 8));
        assert!(!editor.edit_voxel(&config, inside, false));
        assert!(editor.edit_voxel(&config, inside, true));

        let mut color = VBRColor::solid(RGB8Color(0x00FF00));
        assert!(editor.edit_voxel_color(&config, inside, true, &mut color));
        assert_eq!(color, red());

        // empty subtrees are skipped entirely
        let mut fill = None;
        let decision = editor.edit_node_color(&config, NodeCoord::root(), NodePointer::NULL, &mut fill);
        assert_eq!(decision, EditDecision::Unaffected);
    }

    #[test]
    fn sphere_distance_bounds() {
        let editor = SphereEditor::fill(Vector3::new(8, 8, 8), 4, red());
        // cube [0,4)^3: nearest corner (4,4,4) exclusive -> lb_dist -4
        let (min_n2, max_n2) = editor.distance_bounds(Vector3::new(0, 0, 0), Vector3::new(4, 4, 4));
        assert_eq!(min_n2, 3 * 16);
        assert_eq!(max_n2, 3 * 64);

        // cube containing the center
        let (min_n2, _) = editor.distance_bounds(Vector3::new(8, 8, 8), Vector3::new(10, 10, 10));
        assert_eq!(min_n2, 0);
    }
}
