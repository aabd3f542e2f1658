//! Rendering contract between the delivery client and a chat surface.

use crate::state::ChatMessage;

pub const MIN_FOLLOW_TOLERANCE_PX: u32 = 500;
pub const MAX_FOLLOW_TOLERANCE_PX: u32 = 1200;

/// Draws transcript entries. Implementations own the visual surface; the
/// delivery client only tells them what was appended.
pub trait Presenter {
    /// Append one entry, tagged by its source.
    fn render(&mut self, entry: &ChatMessage);

    /// Scroll to the newest entry if the viewer is following along, or
    /// unconditionally when `force` is set.
    fn autoscroll(&mut self, force: bool);

    /// Remove everything except the fixed welcome entry.
    fn clear(&mut self) {}
}

/// How close to the bottom (in pixels) still counts as following the
/// conversation.
pub fn follow_tolerance(viewport_height_px: u32) -> u32 {
    viewport_height_px
        .saturating_mul(4)
        .clamp(MIN_FOLLOW_TOLERANCE_PX, MAX_FOLLOW_TOLERANCE_PX)
}

/// Vertical scroll position of a chat surface, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollState {
    /// Distance of the viewport top from the content top.
    pub offset: u32,
    pub content_height: u32,
    pub viewport_height: u32,
}

impl ScrollState {
    pub fn max_offset(&self) -> u32 {
        self.content_height.saturating_sub(self.viewport_height)
    }

    pub fn distance_from_bottom(&self) -> u32 {
        self.max_offset().saturating_sub(self.offset)
    }

    pub fn is_following(&self) -> bool {
        self.distance_from_bottom() <= follow_tolerance(self.viewport_height)
    }

    pub fn scroll_to_bottom(&mut self) {
        self.offset = self.max_offset();
    }

    pub fn scroll_by(&mut self, delta: i64) {
        let target = (self.offset as i64 + delta).clamp(0, self.max_offset() as i64);
        self.offset = target as u32;
    }

    /// Returns true if the view moved to the bottom.
    pub fn autoscroll(&mut self, force: bool) -> bool {
        if force || self.is_following() {
            self.scroll_to_bottom();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_clamped() {
        assert_eq!(follow_tolerance(100), 500);
        assert_eq!(follow_tolerance(200), 800);
        assert_eq!(follow_tolerance(900), 1200);
        assert_eq!(follow_tolerance(u32::MAX), 1200);
    }

    #[test]
    fn test_follows_when_near_bottom() {
        let mut scroll = ScrollState {
            offset: 1_500,
            content_height: 2_400,
            viewport_height: 600,
        };
        // after the append the view sits 500px above the bottom, inside 1200px
        scroll.content_height += 200;
        assert!(scroll.autoscroll(false));
        assert_eq!(scroll.offset, 2_000);
    }

    #[test]
    fn test_stays_put_when_reading_history() {
        let mut scroll = ScrollState {
            offset: 0,
            content_height: 5_000,
            viewport_height: 600,
        };
        scroll.content_height += 200;
        assert!(!scroll.autoscroll(false));
        assert_eq!(scroll.offset, 0);

        assert!(scroll.autoscroll(true));
        assert_eq!(scroll.offset, 4_600);
    }

    #[test]
    fn test_scroll_by_clamps() {
        let mut scroll = ScrollState {
            offset: 10,
            content_height: 100,
            viewport_height: 50,
        };
        scroll.scroll_by(-100);
        assert_eq!(scroll.offset, 0);
        scroll.scroll_by(1_000);
        assert_eq!(scroll.offset, 50);
    }
}
