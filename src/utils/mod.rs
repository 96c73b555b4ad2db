//! Various utilities functions and types

mod clock;
pub mod config;
mod geometry;
mod ids;

pub use self::clock::{Clock, ClockSource, Monotonic, NonNegativeClockSource, Time};
pub use self::geometry::{Buffer, Coordinate, Point, Rectangle, Size};
pub use self::ids::{BufferId, BufferIdCounter, BUFFER_IDS};
