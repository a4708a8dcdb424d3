//! Mouse cursor
//!
//! A 16x16 monochrome cursor drawn straight onto the screen. Before
//! drawing, the covered pixels are saved; hiding restores them. The
//! compositor relies on this save-under protocol — it never repaints just
//! to remove the cursor.

use spin::Mutex;

use super::framebuffer::{self, Surface};

const CURSOR_W: i32 = 16;
const CURSOR_H: i32 = 16;

/// Cursor shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Arrow,
    Move,
    Hand,
}

/// Arrow bitmap, bit 7 = leftmost pixel
static ARROW: [u16; 16] = [
    0b1000_0000_0000_0000,
    0b1100_0000_0000_0000,
    0b1110_0000_0000_0000,
    0b1111_0000_0000_0000,
    0b1111_1000_0000_0000,
    0b1111_1100_0000_0000,
    0b1111_1110_0000_0000,
    0b1111_1111_0000_0000,
    0b1111_1000_0000_0000,
    0b1101_1000_0000_0000,
    0b1000_1100_0000_0000,
    0b0000_1100_0000_0000,
    0b0000_0110_0000_0000,
    0b0000_0110_0000_0000,
    0b0000_0011_0000_0000,
    0b0000_0000_0000_0000,
];

/// Four-way move cursor
static MOVE: [u16; 16] = [
    0b0000_0010_0000_0000,
    0b0000_0111_0000_0000,
    0b0000_1111_1000_0000,
    0b0000_0010_0000_0000,
    0b0010_0010_0010_0000,
    0b0110_0010_0011_0000,
    0b1111_1111_1111_0000,
    0b0110_0010_0011_0000,
    0b0010_0010_0010_0000,
    0b0000_0010_0000_0000,
    0b0000_1111_1000_0000,
    0b0000_0111_0000_0000,
    0b0000_0010_0000_0000,
    0b0000_0000_0000_0000,
    0b0000_0000_0000_0000,
    0b0000_0000_0000_0000,
];

/// Pointing hand
static HAND: [u16; 16] = [
    0b0000_1100_0000_0000,
    0b0001_0010_0000_0000,
    0b0001_0010_0000_0000,
    0b0001_0010_0000_0000,
    0b0001_0010_0000_0000,
    0b0001_0110_0000_0000,
    0b0111_0110_0000_0000,
    0b1001_1110_0000_0000,
    0b1000_1110_0000_0000,
    0b1000_1110_0000_0000,
    0b0100_0110_0000_0000,
    0b0100_0110_0000_0000,
    0b0010_0010_0000_0000,
    0b0010_0010_0000_0000,
    0b0001_1100_0000_0000,
    0b0000_0000_0000_0000,
];

struct Cursor {
    x: i32,
    y: i32,
    visible: bool,
    state: CursorState,
    saved: [u32; (CURSOR_W * CURSOR_H) as usize],
    color: u32,
}

impl Cursor {
    const fn new() -> Self {
        Cursor {
            x: 0,
            y: 0,
            visible: false,
            state: CursorState::Arrow,
            saved: [0; (CURSOR_W * CURSOR_H) as usize],
            color: 0x00FF_FFFF,
        }
    }

    fn bitmap(&self) -> &'static [u16; 16] {
        match self.state {
            CursorState::Arrow => &ARROW,
            CursorState::Move => &MOVE,
            CursorState::Hand => &HAND,
        }
    }

    fn save_under(&mut self, screen: &Surface) {
        for y in 0..CURSOR_H {
            for x in 0..CURSOR_W {
                self.saved[(y * CURSOR_W + x) as usize] = screen.get_pixel(self.x + x, self.y + y);
            }
        }
    }

    fn restore_under(&self, screen: &mut Surface) {
        for y in 0..CURSOR_H {
            for x in 0..CURSOR_W {
                screen.put_pixel(self.x + x, self.y + y, self.saved[(y * CURSOR_W + x) as usize]);
            }
        }
    }

    fn draw(&self, screen: &mut Surface) {
        let bitmap = self.bitmap();
        for y in 0..CURSOR_H {
            let row = bitmap[y as usize];
            for x in 0..CURSOR_W {
                if row & (0x8000 >> x) != 0 {
                    screen.put_pixel(self.x + x, self.y + y, self.color);
                }
            }
        }
    }
}

static CURSOR: Mutex<Cursor> = Mutex::new(Cursor::new());

/// Center the cursor and draw it
pub fn init() {
    if let Some((w, h)) = framebuffer::screen_size() {
        let mut cursor = CURSOR.lock();
        cursor.x = w as i32 / 2;
        cursor.y = h as i32 / 2;
    }
    show();
}

/// Restore the saved background, if the cursor is on screen
pub fn hide() {
    framebuffer::with_screen(|screen| {
        let mut cursor = CURSOR.lock();
        if cursor.visible {
            cursor.restore_under(screen);
            cursor.visible = false;
        }
    });
}

/// Save the background under the cursor, then draw it
pub fn show() {
    framebuffer::with_screen(|screen| {
        let mut cursor = CURSOR.lock();
        if !cursor.visible {
            cursor.save_under(screen);
            cursor.draw(screen);
            cursor.visible = true;
        }
    });
}

/// Hide at the old position, draw at the new one
pub fn move_to(x: i32, y: i32) {
    framebuffer::with_screen(|screen| {
        let mut cursor = CURSOR.lock();
        if cursor.visible {
            cursor.restore_under(screen);
        }
        cursor.x = x;
        cursor.y = y;
        cursor.save_under(screen);
        cursor.draw(screen);
        cursor.visible = true;
    });
}

/// Switch the cursor shape, redrawing in place when visible
pub fn set_state(state: CursorState) {
    framebuffer::with_screen(|screen| {
        let mut cursor = CURSOR.lock();
        if cursor.state == state {
            return;
        }
        if cursor.visible {
            cursor.restore_under(screen);
            cursor.state = state;
            cursor.save_under(screen);
            cursor.draw(screen);
        } else {
            cursor.state = state;
        }
    });
}

/// Current position
pub fn position() -> (i32, i32) {
    let cursor = CURSOR.lock();
    (cursor.x, cursor.y)
}
