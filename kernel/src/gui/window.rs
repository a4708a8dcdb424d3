//! Window manager
//!
//! Up to 16 windows composited back-to-front by z-order, each with its own
//! content back buffer. Dragging never moves the real window: an XOR
//! outline tracks the cursor (two XORs per position — erase old, draw new)
//! and the window jumps to the drop point on release. Compositing is
//! suspended for the whole drag, so the desktop underneath stays intact.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use spin::Mutex;

use crate::graphics::cursor;
use crate::graphics::framebuffer::{self, Surface};

/// Window table capacity
pub const MAX_WINDOWS: usize = 16;

/// Longest window title
pub const MAX_TITLE_LEN: usize = 63;

/// Decoration geometry
pub const TITLE_HEIGHT: u32 = 20;
pub const BORDER_SIZE: u32 = 2;

/// Flag bits
pub mod flags {
    pub const VISIBLE: u32 = 1 << 0;
    pub const MOVABLE: u32 = 1 << 1;
    pub const CLOSABLE: u32 = 1 << 2;
    pub const FOCUSED: u32 = 1 << 3;
    pub const DIRTY: u32 = 1 << 4;

    /// The usual application window
    pub const DEFAULT: u32 = VISIBLE | MOVABLE | CLOSABLE;
}

/// Palette
mod colors {
    pub const DESKTOP: u32 = 0x0000_8080;
    pub const BORDER: u32 = 0x0030_3030;
    pub const TITLE_ACTIVE: u32 = 0x0020_60A0;
    pub const TITLE_INACTIVE: u32 = 0x0050_5050;
    pub const TITLE_TEXT: u32 = 0x00FF_FFFF;
    pub const CLOSE_BTN: u32 = 0x00C0_3030;
    pub const CONTENT_BG: u32 = 0x00D0_D0D0;
}

/// A window: position and total size cover the decorations; the back
/// buffer holds only the content area.
pub struct Window {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub content_width: u32,
    pub content_height: u32,
    framebuffer: Box<[u32]>,
    pub title: String,
    pub flags: u32,
    pub z_order: i32,
    pub on_paint: Option<fn(&mut Window)>,
    pub on_close: Option<fn(&Window)>,
    pub user_data: usize,
}

impl Window {
    fn new(id: u32, title: &str, x: i32, y: i32, content_width: u32, content_height: u32, flags: u32) -> Window {
        let mut title_owned = String::from(title);
        title_owned.truncate(MAX_TITLE_LEN);

        Window {
            id,
            x,
            y,
            width: content_width + BORDER_SIZE * 2,
            height: content_height + TITLE_HEIGHT + BORDER_SIZE,
            content_width,
            content_height,
            framebuffer: vec![colors::CONTENT_BG; (content_width * content_height) as usize]
                .into_boxed_slice(),
            title: title_owned,
            flags: flags | self::flags::DIRTY,
            z_order: 0,
            on_paint: None,
            on_close: None,
            user_data: 0,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.flags & flags::VISIBLE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & flags::DIRTY != 0
    }

    pub fn invalidate(&mut self) {
        self.flags |= flags::DIRTY;
    }

    pub fn show(&mut self) {
        self.flags |= flags::VISIBLE | flags::DIRTY;
    }

    pub fn hide(&mut self) {
        self.flags &= !flags::VISIBLE;
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = String::from(title);
        self.title.truncate(MAX_TITLE_LEN);
        self.invalidate();
    }

    /// Resize the content area, replacing the back buffer
    pub fn resize(&mut self, content_width: u32, content_height: u32) {
        self.framebuffer = vec![colors::CONTENT_BG; (content_width * content_height) as usize]
            .into_boxed_slice();
        self.content_width = content_width;
        self.content_height = content_height;
        self.width = content_width + BORDER_SIZE * 2;
        self.height = content_height + TITLE_HEIGHT + BORDER_SIZE;
        self.invalidate();
    }

    fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && x < self.x + self.width as i32
            && y >= self.y
            && y < self.y + self.height as i32
    }

    fn in_title_bar(&self, x: i32, y: i32) -> bool {
        self.contains(x, y) && y < self.y + TITLE_HEIGHT as i32
    }

    fn in_close_button(&self, x: i32, y: i32) -> bool {
        let btn_x = self.x + self.width as i32 - TITLE_HEIGHT as i32;
        x >= btn_x
            && x < self.x + self.width as i32
            && y >= self.y
            && y < self.y + TITLE_HEIGHT as i32
    }

    /// Top-left of the content area in screen coordinates
    pub fn content_origin(&self) -> (i32, i32) {
        (self.x + BORDER_SIZE as i32, self.y + TITLE_HEIGHT as i32)
    }

    // --- content drawing, all into the back buffer ---

    pub fn clear(&mut self, color: u32) {
        self.framebuffer.fill(color);
        self.invalidate();
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: u32) {
        if x < self.content_width && y < self.content_height {
            self.framebuffer[(y * self.content_width + x) as usize] = color;
        }
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> u32 {
        if x < self.content_width && y < self.content_height {
            self.framebuffer[(y * self.content_width + x) as usize]
        } else {
            0
        }
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: u32) {
        for py in y..(y + h).min(self.content_height) {
            for px in x..(x + w).min(self.content_width) {
                self.framebuffer[(py * self.content_width + px) as usize] = color;
            }
        }
        self.invalidate();
    }

    pub fn draw_text(&mut self, text: &str, x: u32, y: u32, color: u32) {
        let mut cx = x;
        let mut cy = y;
        for c in text.chars() {
            if c == '\n' {
                cy += 8;
                cx = x;
                continue;
            }
            let glyph = crate::graphics::font::get_glyph(c);
            for (row, &bits) in glyph.iter().enumerate() {
                for col in 0..8u32 {
                    if bits & (1 << col) != 0 {
                        self.put_pixel(cx + col, cy + row as u32, color);
                    }
                }
            }
            cx += 8;
        }
        self.invalidate();
    }

    pub fn draw_image(&mut self, pixels: &[u32], x: u32, y: u32, w: u32, h: u32) {
        for py in 0..h {
            for px in 0..w {
                if let Some(&color) = pixels.get((py * w + px) as usize) {
                    self.put_pixel(x + px, y + py, color);
                }
            }
        }
        self.invalidate();
    }
}

struct DragState {
    window_id: u32,
    offset_x: i32,
    offset_y: i32,
    outline_x: i32,
    outline_y: i32,
    width: u32,
    height: u32,
}

/// The window table plus focus, drag and damage state
pub struct WindowManager {
    windows: [Option<Window>; MAX_WINDOWS],
    next_id: u32,
    focused: Option<u32>,
    drag: Option<DragState>,
    global_dirty: bool,
    last_buttons: u8,
}

impl WindowManager {
    pub const fn new() -> Self {
        WindowManager {
            windows: [const { None }; MAX_WINDOWS],
            next_id: 1,
            focused: None,
            drag: None,
            global_dirty: true,
            last_buttons: 0,
        }
    }

    fn highest_z(&self) -> i32 {
        self.windows
            .iter()
            .flatten()
            .map(|w| w.z_order)
            .max()
            .unwrap_or(0)
    }

    fn window_count(&self) -> usize {
        self.windows.iter().flatten().count()
    }

    fn slot_of(&self, id: u32) -> Option<usize> {
        self.windows
            .iter()
            .position(|w| w.as_ref().map(|w| w.id) == Some(id))
    }

    /// Create a window; it comes up focused and on top
    pub fn create(
        &mut self,
        title: &str,
        x: i32,
        y: i32,
        content_width: u32,
        content_height: u32,
        window_flags: u32,
    ) -> Option<u32> {
        let slot = self.windows.iter().position(|w| w.is_none())?;

        let id = self.next_id;
        self.next_id += 1;

        let mut window = Window::new(id, title, x, y, content_width, content_height, window_flags);
        window.z_order = self.highest_z() + 1;
        self.windows[slot] = Some(window);
        self.focus(id);
        Some(id)
    }

    /// Destroy a window and schedule a desktop repaint for the area it
    /// uncovered
    pub fn destroy(&mut self, id: u32) {
        let Some(slot) = self.slot_of(id) else { return };

        if let Some(window) = self.windows[slot].take() {
            if let Some(on_close) = window.on_close {
                on_close(&window);
            }
        }

        if self.focused == Some(id) {
            self.focused = None;
        }
        if self.drag.as_ref().map(|d| d.window_id) == Some(id) {
            self.drag = None;
        }
        self.global_dirty = true;
    }

    /// Focus a window: steal the flag from the previous holder and raise
    /// above everything else
    pub fn focus(&mut self, id: u32) {
        if let Some(prev_id) = self.focused {
            if prev_id != id {
                if let Some(slot) = self.slot_of(prev_id) {
                    if let Some(prev) = self.windows[slot].as_mut() {
                        prev.flags &= !flags::FOCUSED;
                        prev.flags |= flags::DIRTY;
                    }
                }
            }
        }

        let top = self.highest_z() + 1;
        if let Some(slot) = self.slot_of(id) {
            if let Some(window) = self.windows[slot].as_mut() {
                window.flags |= flags::FOCUSED | flags::DIRTY;
                window.z_order = top;
                self.focused = Some(id);
            }
        }
    }

    pub fn focused_window(&self) -> Option<u32> {
        self.focused
    }

    /// Topmost visible window containing the point
    pub fn window_at(&self, x: i32, y: i32) -> Option<u32> {
        self.windows
            .iter()
            .flatten()
            .filter(|w| w.is_visible() && w.contains(x, y))
            .max_by_key(|w| w.z_order)
            .map(|w| w.id)
    }

    /// Mutable access to a window's contents
    pub fn with_window<F, R>(&mut self, id: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut Window) -> R,
    {
        let slot = self.slot_of(id)?;
        self.windows[slot].as_mut().map(f)
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    pub fn needs_render(&self) -> bool {
        self.global_dirty || self.windows.iter().flatten().any(|w| w.is_dirty())
    }

    pub fn force_render(&mut self) {
        self.global_dirty = true;
    }

    /// Mouse event ingestion. Left press focuses/raises, may close or
    /// start a drag (mutually exclusive branches); held motion moves the
    /// XOR outline; release commits the move.
    pub fn handle_mouse(&mut self, x: i32, y: i32, buttons: u8, screen: &mut Surface) {
        let left_pressed = buttons & 1 != 0 && self.last_buttons & 1 == 0;
        let left_released = buttons & 1 == 0 && self.last_buttons & 1 != 0;
        let left_held = buttons & 1 != 0;

        // Outline tracking while the button is down
        if left_held {
            if let Some(drag) = self.drag.as_mut() {
                let new_x = x - drag.offset_x;
                let new_y = y - drag.offset_y;
                if new_x != drag.outline_x || new_y != drag.outline_y {
                    screen.xor_outline_rect(drag.outline_x, drag.outline_y, drag.width, drag.height);
                    drag.outline_x = new_x;
                    drag.outline_y = new_y;
                    screen.xor_outline_rect(drag.outline_x, drag.outline_y, drag.width, drag.height);
                }
            }
        }

        // Drop: erase the outline, move the real window, repaint the world
        if left_released {
            if let Some(drag) = self.drag.take() {
                screen.xor_outline_rect(drag.outline_x, drag.outline_y, drag.width, drag.height);
                if let Some(slot) = self.slot_of(drag.window_id) {
                    if let Some(window) = self.windows[slot].as_mut() {
                        window.x = drag.outline_x;
                        window.y = drag.outline_y;
                        window.flags |= flags::DIRTY;
                    }
                }
                self.global_dirty = true;
            }
        }

        // A press can only start something when no drag is in flight, so
        // destroying a window mid-drag is impossible by construction
        if left_pressed && self.drag.is_none() {
            if let Some(id) = self.window_at(x, y) {
                self.focus(id);

                let slot = self.slot_of(id).unwrap();
                let window = self.windows[slot].as_ref().unwrap();
                let closable = window.flags & flags::CLOSABLE != 0;
                let movable = window.flags & flags::MOVABLE != 0;

                if closable && window.in_close_button(x, y) {
                    self.destroy(id);
                } else if movable && window.in_title_bar(x, y) {
                    let drag = DragState {
                        window_id: id,
                        offset_x: x - window.x,
                        offset_y: y - window.y,
                        outline_x: window.x,
                        outline_y: window.y,
                        width: window.width,
                        height: window.height,
                    };
                    screen.xor_outline_rect(drag.outline_x, drag.outline_y, drag.width, drag.height);
                    self.drag = Some(drag);
                }
            }
        }

        self.last_buttons = buttons;
    }

    /// Composite every visible window back-to-front. No-op while a drag
    /// is in flight or when nothing is dirty.
    pub fn render(&mut self, screen: &mut Surface) {
        if self.drag.is_some() {
            return;
        }

        if self.global_dirty && self.window_count() == 0 {
            screen.clear(colors::DESKTOP);
            self.global_dirty = false;
            return;
        }

        if !self.needs_render() {
            return;
        }

        if self.global_dirty {
            screen.clear(colors::DESKTOP);
        }

        // Visible slots sorted by ascending z (bubble sort, N <= 16)
        let mut order: [usize; MAX_WINDOWS] = [0; MAX_WINDOWS];
        let mut count = 0;
        for (i, slot) in self.windows.iter().enumerate() {
            if slot.as_ref().map(|w| w.is_visible()).unwrap_or(false) {
                order[count] = i;
                count += 1;
            }
        }
        for i in 0..count.saturating_sub(1) {
            for j in 0..count - i - 1 {
                let za = self.windows[order[j]].as_ref().unwrap().z_order;
                let zb = self.windows[order[j + 1]].as_ref().unwrap().z_order;
                if za > zb {
                    order.swap(j, j + 1);
                }
            }
        }

        for &slot in &order[..count] {
            let window = self.windows[slot].as_mut().unwrap();

            if let Some(on_paint) = window.on_paint {
                on_paint(window);
            }

            let wx = window.x;
            let wy = window.y;

            // Border, then title bar in the focus color
            screen.fill_rect(wx, wy, window.width, window.height, colors::BORDER);
            let title_color = if window.flags & flags::FOCUSED != 0 {
                colors::TITLE_ACTIVE
            } else {
                colors::TITLE_INACTIVE
            };
            screen.fill_rect(wx + 1, wy + 1, window.width - 2, TITLE_HEIGHT - 1, title_color);
            screen.draw_text(&window.title, wx + 4, wy + 6, colors::TITLE_TEXT, Some(title_color));

            if window.flags & flags::CLOSABLE != 0 {
                let btn_x = wx + window.width as i32 - TITLE_HEIGHT as i32 + 2;
                let btn_y = wy + 2;
                screen.fill_rect(btn_x, btn_y, TITLE_HEIGHT - 4, TITLE_HEIGHT - 4, colors::CLOSE_BTN);
                screen.draw_text("X", btn_x + 4, btn_y + 4, colors::TITLE_TEXT, Some(colors::CLOSE_BTN));
            }

            // Content blit
            let (cx, cy) = window.content_origin();
            for py in 0..window.content_height {
                for px in 0..window.content_width {
                    screen.put_pixel(
                        cx + px as i32,
                        cy + py as i32,
                        window.framebuffer[(py * window.content_width + px) as usize],
                    );
                }
            }

            window.flags &= !flags::DIRTY;
        }

        self.global_dirty = false;
    }
}

/// Global window manager
static WM: Mutex<WindowManager> = Mutex::new(WindowManager::new());

/// Paint the empty desktop
pub fn init() {
    framebuffer::with_screen(|screen| {
        WM.lock().render(screen);
    });
    crate::log!("wm: window manager ready");
}

pub fn create_window(title: &str, x: i32, y: i32, w: u32, h: u32, window_flags: u32) -> Option<u32> {
    WM.lock().create(title, x, y, w, h, window_flags)
}

pub fn destroy_window(id: u32) {
    WM.lock().destroy(id);
}

/// Run a closure against a window's contents
pub fn with_window<F, R>(id: u32, f: F) -> Option<R>
where
    F: FnOnce(&mut Window) -> R,
{
    WM.lock().with_window(id, f)
}

/// Feed a mouse state change through the window manager
pub fn handle_mouse(x: i32, y: i32, buttons: u8) {
    framebuffer::with_screen(|screen| {
        WM.lock().handle_mouse(x, y, buttons, screen);
    });
}

/// Composite, keeping the cursor's save-under buffer coherent
pub fn render() {
    {
        let wm = WM.lock();
        if wm.is_dragging() || !wm.needs_render() {
            return;
        }
    }
    cursor::hide();
    framebuffer::with_screen(|screen| {
        WM.lock().render(screen);
    });
    cursor::show();
}

pub fn is_dragging() -> bool {
    WM.lock().is_dragging()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(width: u32, height: u32) -> (WindowManager, Surface) {
        crate::memory::heap::test_support::init_test_heap();
        let mut wm = WindowManager::new();
        let mut screen = Surface::owned(width, height);
        wm.render(&mut screen); // paints the desktop
        (wm, screen)
    }

    fn content_pixel(screen: &Surface, wm_x: i32, wm_y: i32, px: i32, py: i32) -> u32 {
        screen.get_pixel(
            wm_x + BORDER_SIZE as i32 + px,
            wm_y + TITLE_HEIGHT as i32 + py,
        )
    }

    #[test]
    fn only_one_window_is_focused() {
        let (mut wm, _screen) = setup(640, 480);
        let a = wm.create("a", 10, 10, 100, 80, flags::DEFAULT).unwrap();
        let b = wm.create("b", 50, 50, 100, 80, flags::DEFAULT).unwrap();

        let focused: usize = wm
            .windows
            .iter()
            .flatten()
            .filter(|w| w.flags & flags::FOCUSED != 0)
            .count();
        assert_eq!(focused, 1);
        assert_eq!(wm.focused_window(), Some(b));

        wm.focus(a);
        assert_eq!(wm.focused_window(), Some(a));
        let focused: usize = wm
            .windows
            .iter()
            .flatten()
            .filter(|w| w.flags & flags::FOCUSED != 0)
            .count();
        assert_eq!(focused, 1);
    }

    #[test]
    fn z_orders_stay_unique_and_clicks_raise() {
        let (mut wm, mut screen) = setup(640, 480);
        let a = wm.create("a", 10, 10, 100, 80, flags::DEFAULT).unwrap();
        let b = wm.create("b", 40, 40, 100, 80, flags::DEFAULT).unwrap();
        let c = wm.create("c", 70, 70, 100, 80, flags::DEFAULT).unwrap();

        let mut zs: alloc::vec::Vec<i32> =
            wm.windows.iter().flatten().map(|w| w.z_order).collect();
        zs.sort_unstable();
        zs.dedup();
        assert_eq!(zs.len(), 3);

        // All three overlap (75, 75); c is on top, then a click raises a
        assert_eq!(wm.window_at(75, 75), Some(c));
        wm.handle_mouse(15, 45, 1, &mut screen); // content area of a only
        wm.handle_mouse(15, 45, 0, &mut screen);
        assert_eq!(wm.focused_window(), Some(a));
        assert_eq!(wm.window_at(75, 75), Some(a));
        let _ = b;
    }

    #[test]
    fn compositor_shows_topmost_content_at_overlap() {
        let (mut wm, mut screen) = setup(640, 480);
        let a = wm.create("a", 100, 100, 200, 150, flags::DEFAULT).unwrap();
        let b = wm.create("b", 150, 130, 200, 150, flags::DEFAULT).unwrap();
        wm.with_window(a, |w| w.clear(0x00FF_0000));
        wm.with_window(b, |w| w.clear(0x0000_FF00));
        wm.render(&mut screen);

        // Point inside both windows' content: b was created later, wins
        assert_eq!(content_pixel(&screen, 150, 130, 10, 10), 0x0000_FF00);
        // Point only a covers
        assert_eq!(content_pixel(&screen, 100, 100, 5, 5), 0x00FF_0000);
        // Desktop elsewhere
        assert_eq!(screen.get_pixel(600, 400), 0x0000_8080);
    }

    #[test]
    fn drag_moves_window_by_cursor_delta() {
        let (mut wm, mut screen) = setup(640, 480);
        let id = wm.create("drag me", 100, 100, 200, 150, flags::DEFAULT).unwrap();
        wm.render(&mut screen);

        // Press in the title bar, move, release (scenario from the drag
        // contract: down at (110,105), up at (300,250))
        wm.handle_mouse(110, 105, 1, &mut screen);
        assert!(wm.is_dragging());
        wm.handle_mouse(300, 250, 1, &mut screen);
        wm.handle_mouse(300, 250, 0, &mut screen);
        assert!(!wm.is_dragging());

        let (x, y) = wm.with_window(id, |w| (w.x, w.y)).unwrap();
        assert_eq!((x, y), (290, 245));
    }

    #[test]
    fn drag_only_touches_outline_pixels() {
        let (mut wm, mut screen) = setup(640, 480);
        let id = wm.create("w", 100, 100, 200, 150, flags::DEFAULT).unwrap();
        wm.render(&mut screen);
        let (w, h) = wm.with_window(id, |w| (w.width, w.height)).unwrap();

        let before: alloc::vec::Vec<u32> = (0..480)
            .flat_map(|y| (0..640).map(move |x| (x, y)))
            .map(|(x, y)| screen.get_pixel(x, y))
            .collect();

        wm.handle_mouse(110, 105, 1, &mut screen);
        wm.handle_mouse(300, 250, 1, &mut screen);

        // Compositing is suspended during the drag
        wm.render(&mut screen);

        let on_outline = |x: i32, y: i32, ox: i32, oy: i32| -> bool {
            let (w, h) = (w as i32, h as i32);
            let on_h = (y == oy || y == oy + h - 1) && x >= ox && x < ox + w;
            let on_v = (x == ox || x == ox + w - 1) && y >= oy && y < oy + h;
            on_h || on_v
        };

        for y in 0..480 {
            for x in 0..640 {
                let changed = screen.get_pixel(x, y) != before[(y * 640 + x) as usize];
                if changed {
                    // Old outline was erased+redrawn at (100,100) and the
                    // live one sits at (290,245)
                    assert!(
                        on_outline(x, y, 290, 245),
                        "pixel ({}, {}) changed outside the outline",
                        x,
                        y
                    );
                }
            }
        }
    }

    #[test]
    fn press_release_same_pixel_leaves_position() {
        let (mut wm, mut screen) = setup(640, 480);
        let id = wm.create("w", 100, 100, 200, 150, flags::DEFAULT).unwrap();
        wm.render(&mut screen);

        wm.handle_mouse(110, 105, 1, &mut screen);
        wm.handle_mouse(110, 105, 0, &mut screen);

        let (x, y) = wm.with_window(id, |w| (w.x, w.y)).unwrap();
        assert_eq!((x, y), (100, 100));

        // The next render clears all dirt
        wm.render(&mut screen);
        assert!(!wm.needs_render());
    }

    #[test]
    fn close_button_destroys_and_repaints_desktop() {
        let (mut wm, mut screen) = setup(640, 480);
        let id = wm.create("w", 100, 100, 200, 150, flags::DEFAULT).unwrap();
        wm.render(&mut screen);

        // Close button lives at the right end of the title bar
        let bx = 100 + (200 + BORDER_SIZE as i32 * 2) - TITLE_HEIGHT as i32 + 4;
        wm.handle_mouse(bx, 104, 1, &mut screen);
        wm.handle_mouse(bx, 104, 0, &mut screen);

        assert_eq!(wm.window_count(), 0);
        assert!(wm.needs_render());
        wm.render(&mut screen);
        // The window's old area is desktop again
        assert_eq!(screen.get_pixel(150, 150), 0x0000_8080);
        let _ = id;
    }

    #[test]
    fn non_movable_window_ignores_title_drag() {
        let (mut wm, mut screen) = setup(640, 480);
        let id = wm
            .create("pinned", 100, 100, 100, 80, flags::VISIBLE)
            .unwrap();
        wm.render(&mut screen);

        wm.handle_mouse(110, 105, 1, &mut screen);
        assert!(!wm.is_dragging());
        wm.handle_mouse(200, 200, 1, &mut screen);
        wm.handle_mouse(200, 200, 0, &mut screen);

        let (x, y) = wm.with_window(id, |w| (w.x, w.y)).unwrap();
        assert_eq!((x, y), (100, 100));
    }

    #[test]
    fn render_skips_when_nothing_dirty() {
        let (mut wm, mut screen) = setup(320, 200);
        wm.create("w", 10, 10, 50, 40, flags::DEFAULT).unwrap();
        wm.render(&mut screen);
        assert!(!wm.needs_render());

        // Draw junk directly on the screen; a clean render must not
        // repaint over it
        screen.put_pixel(300, 5, 0x00AB_CDEF);
        wm.render(&mut screen);
        assert_eq!(screen.get_pixel(300, 5), 0x00AB_CDEF);
    }
}
