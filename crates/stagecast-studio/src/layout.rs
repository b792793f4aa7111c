//! Layout table and the auto-spotlight state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stagecast_common::{Error, Result};
use tracing::{debug, info};

use crate::ids::ParticipantId;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    #[serde(rename = "grid-2x2")]
    Grid2x2,
    #[serde(rename = "grid-3up")]
    Grid3Up,
    #[serde(rename = "grid-4up")]
    Grid4Up,
    PictureInPicture,
    SideBySide,
    Spotlight,
}

impl Layout {
    pub const ALL: [Layout; 6] = [
        Layout::Grid2x2,
        Layout::Grid3Up,
        Layout::Grid4Up,
        Layout::PictureInPicture,
        Layout::SideBySide,
        Layout::Spotlight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Layout::Grid2x2 => "grid-2x2",
            Layout::Grid3Up => "grid-3up",
            Layout::Grid4Up => "grid-4up",
            Layout::PictureInPicture => "picture-in-picture",
            Layout::SideBySide => "side-by-side",
            Layout::Spotlight => "spotlight",
        }
    }

    pub fn spec(self) -> &'static LayoutSpec {
        // Table rows are in `Layout::ALL` order.
        &LAYOUT_TABLE[self as usize]
    }

    pub fn guest_cap(self) -> usize {
        self.spec().guest_cap
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Layout::ALL
            .into_iter()
            .find(|layout| layout.as_str() == s)
            .ok_or_else(|| Error::invalid(format!("unknown layout '{}'", s)))
    }
}

/// Rectangle in canvas-fraction coordinates (0.0..=1.0 on both axes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotRect {
    pub participant: ParticipantId,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl SlotRect {
    fn new(participant: ParticipantId, x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            participant,
            x,
            y,
            w,
            h,
        }
    }

    /// Edges are rounded independently so adjacent slots share a boundary
    /// with no gap.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let edge = |v: f32, max: u32| ((v * max as f32).round().max(0.0) as u32).min(max);
        let x0 = edge(self.x, width);
        let y0 = edge(self.y, height);
        let x1 = edge(self.x + self.w, width);
        let y1 = edge(self.y + self.h, height);
        PixelRect {
            x: x0,
            y: y0,
            w: x1.saturating_sub(x0),
            h: y1.saturating_sub(y0),
        }
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn overlaps(&self, other: &SlotRect) -> bool {
        const EPS: f32 = 1e-6;
        self.x + EPS < other.x + other.w
            && other.x + EPS < self.x + self.w
            && self.y + EPS < other.y + other.h
            && other.y + EPS < self.y + self.h
    }
}

pub type Geometry = fn(&[ParticipantId]) -> Vec<SlotRect>;

pub struct LayoutSpec {
    pub layout: Layout,
    pub guest_cap: usize,
    /// Maps the visible participants (host first) to slot rectangles.
    pub geometry: Geometry,
}

impl fmt::Debug for LayoutSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutSpec")
            .field("layout", &self.layout)
            .field("guest_cap", &self.guest_cap)
            .finish()
    }
}

pub static LAYOUT_TABLE: [LayoutSpec; 6] = [
    LayoutSpec {
        layout: Layout::Grid2x2,
        guest_cap: 3,
        geometry: grid_2x2,
    },
    LayoutSpec {
        layout: Layout::Grid3Up,
        guest_cap: 4,
        geometry: grid_3up,
    },
    LayoutSpec {
        layout: Layout::Grid4Up,
        guest_cap: 3,
        geometry: grid_4up,
    },
    LayoutSpec {
        layout: Layout::PictureInPicture,
        guest_cap: 1,
        geometry: picture_in_picture,
    },
    LayoutSpec {
        layout: Layout::SideBySide,
        guest_cap: 1,
        geometry: side_by_side,
    },
    LayoutSpec {
        layout: Layout::Spotlight,
        guest_cap: 0,
        geometry: spotlight,
    },
];

fn full(id: ParticipantId) -> SlotRect {
    SlotRect::new(id, 0.0, 0.0, 1.0, 1.0)
}

fn grid_2x2(ids: &[ParticipantId]) -> Vec<SlotRect> {
    match ids {
        [] => Vec::new(),
        [a] => vec![full(*a)],
        [a, b] => vec![
            SlotRect::new(*a, 0.0, 0.0, 0.5, 1.0),
            SlotRect::new(*b, 0.5, 0.0, 0.5, 1.0),
        ],
        [a, b, c] => vec![
            SlotRect::new(*a, 0.0, 0.0, 0.5, 0.5),
            SlotRect::new(*b, 0.5, 0.0, 0.5, 0.5),
            SlotRect::new(*c, 0.0, 0.5, 1.0, 0.5),
        ],
        _ => ids
            .iter()
            .take(4)
            .enumerate()
            .map(|(i, id)| {
                let col = (i % 2) as f32;
                let row = (i / 2) as f32;
                SlotRect::new(*id, col * 0.5, row * 0.5, 0.5, 0.5)
            })
            .collect(),
    }
}

fn grid_3up(ids: &[ParticipantId]) -> Vec<SlotRect> {
    const TOP: f32 = 0.6;
    match ids {
        [] => Vec::new(),
        [host] => vec![full(*host)],
        [host, guests @ ..] => {
            let mut rects = vec![SlotRect::new(*host, 0.0, 0.0, 1.0, TOP)];
            let w = 1.0 / guests.len() as f32;
            rects.extend(
                guests
                    .iter()
                    .enumerate()
                    .map(|(i, id)| SlotRect::new(*id, i as f32 * w, TOP, w, 1.0 - TOP)),
            );
            rects
        }
    }
}

fn grid_4up(ids: &[ParticipantId]) -> Vec<SlotRect> {
    match ids {
        [] => Vec::new(),
        [host] => vec![full(*host)],
        [host, guests @ ..] => {
            let mut rects = vec![SlotRect::new(*host, 0.0, 0.0, 0.5, 1.0)];
            let h = 1.0 / guests.len() as f32;
            rects.extend(
                guests
                    .iter()
                    .enumerate()
                    .map(|(i, id)| SlotRect::new(*id, 0.5, i as f32 * h, 0.5, h)),
            );
            rects
        }
    }
}

/// Inset of 300x225 placed 20 px from the right and 15 px from the bottom
/// of a 1280x720 canvas, kept proportional for other sizes.
const PIP_INSET: (f32, f32, f32, f32) = (960.0 / 1280.0, 480.0 / 720.0, 300.0 / 1280.0, 225.0 / 720.0);

fn picture_in_picture(ids: &[ParticipantId]) -> Vec<SlotRect> {
    let (x, y, w, h) = PIP_INSET;
    match ids {
        [] => Vec::new(),
        [host] => vec![full(*host)],
        [host, guest, ..] => vec![full(*host), SlotRect::new(*guest, x, y, w, h)],
    }
}

fn side_by_side(ids: &[ParticipantId]) -> Vec<SlotRect> {
    match ids {
        [] => Vec::new(),
        [host] => vec![full(*host)],
        [host, guest, ..] => vec![
            SlotRect::new(*host, 0.0, 0.0, 0.5, 1.0),
            SlotRect::new(*guest, 0.5, 0.0, 0.5, 1.0),
        ],
    }
}

fn spotlight(ids: &[ParticipantId]) -> Vec<SlotRect> {
    ids.first().map(|id| vec![full(*id)]).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutChange {
    Applied(Layout),
    /// Manual selection while auto-spotlight is on.
    Ignored,
}

#[derive(Debug)]
pub struct LayoutEngine {
    manual: Layout,
    auto: bool,
    spotlighted: Option<ParticipantId>,
}

impl Default for LayoutEngine {
    fn default() -> Self {
        Self::new(Layout::Grid2x2)
    }
}

impl LayoutEngine {
    pub fn new(initial: Layout) -> Self {
        Self {
            manual: initial,
            auto: false,
            spotlighted: None,
        }
    }

    /// Layout in effect: forced spotlight while auto mode has a speaker,
    /// otherwise the last manual selection.
    pub fn current(&self) -> Layout {
        if self.auto && self.spotlighted.is_some() {
            Layout::Spotlight
        } else {
            self.manual
        }
    }

    pub fn manual(&self) -> Layout {
        self.manual
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Participant forced into the spotlight by auto mode.
    pub fn spotlighted(&self) -> Option<ParticipantId> {
        if self.auto {
            self.spotlighted
        } else {
            None
        }
    }

    pub fn select(&mut self, layout: Layout) -> LayoutChange {
        if self.auto {
            debug!("layout: ignoring manual '{}' while auto-spotlight is on", layout);
            return LayoutChange::Ignored;
        }
        self.manual = layout;
        info!("layout: {}", layout);
        LayoutChange::Applied(layout)
    }

    pub fn set_auto(&mut self, enabled: bool, current_speaker: Option<ParticipantId>) -> Layout {
        if enabled == self.auto {
            return self.current();
        }
        self.auto = enabled;
        self.spotlighted = if enabled { current_speaker } else { None };
        let layout = self.current();
        info!(
            "layout: auto-spotlight {}, now {}",
            if enabled { "on" } else { "off" },
            layout
        );
        layout
    }

    /// Returns `true` when the speaker change forced a layout transition.
    pub fn on_active_speaker(&mut self, id: ParticipantId) -> bool {
        if !self.auto || self.spotlighted == Some(id) {
            return false;
        }
        self.spotlighted = Some(id);
        info!("layout: spotlight on {}", id);
        true
    }

    /// Reject a new guest that would exceed the current layout's cap. Auto
    /// mode shows one participant at a time and accepts any registered guest.
    pub fn check_guest_capacity(&self, registered: usize) -> Result<()> {
        if self.auto {
            return Ok(());
        }
        let layout = self.current();
        let cap = layout.guest_cap();
        if registered + 1 > cap {
            return Err(Error::capacity(format!(
                "layout {} allows at most {} guest(s)",
                layout, cap
            )));
        }
        Ok(())
    }

    /// Participants shown under the current layout: the host followed by the
    /// first `cap` guests in slot order, or exactly one for spotlight.
    pub fn visible(&self, registry: &Registry) -> Vec<ParticipantId> {
        let layout = self.current();
        if layout == Layout::Spotlight {
            let target = self
                .spotlighted()
                .or_else(|| registry.active_speaker())
                .filter(|id| registry.get(*id).is_some())
                .unwrap_or(ParticipantId::Host);
            return vec![target];
        }
        std::iter::once(ParticipantId::Host)
            .chain(registry.guests().map(|p| p.id).take(layout.guest_cap()))
            .collect()
    }

    pub fn geometry(&self, registry: &Registry) -> Vec<SlotRect> {
        let visible = self.visible(registry);
        (self.current().spec().geometry)(&visible)
    }
}
