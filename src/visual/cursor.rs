//! Touch cursor: a small white arrow with a black trailing edge, drawn
//! over the active screen at the last reported touch position.

use super::Surface;

pub fn draw_cursor(surface: &mut Surface, cx: i32, cy: i32) {
    if cx < 0 || cy < 0 || cx >= surface.width as i32 || cy >= surface.height as i32 {
        return;
    }

    for dy in 0..12 {
        let width = if dy < 8 { dy / 2 + 1 } else { 12 - dy };
        for dx in 0..width {
            surface.pixel(cx + dx, cy + dy, 0x00FF_FFFF);
        }
        // Black outline on the right edge
        surface.pixel(cx + width, cy + dy, 0x0000_0000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_cursor_draws_inside_bounds() {
        let mut pixels = vec![0x00AA_AAAAu32; 32 * 32];
        let mut s = Surface::new(&mut pixels, 32, 32);
        draw_cursor(&mut s, 5, 5);
        assert!(pixels.iter().any(|&p| p == 0x00FF_FFFF));
        assert!(pixels.iter().any(|&p| p == 0));
    }

    #[test]
    fn test_cursor_offscreen_is_noop() {
        let mut pixels = vec![0u32; 16 * 16];
        let mut s = Surface::new(&mut pixels, 16, 16);
        draw_cursor(&mut s, -1, 4);
        draw_cursor(&mut s, 40, 4);
        assert!(pixels.iter().all(|&p| p == 0));
    }
}
