pub mod booking;
pub mod seat;
pub mod show;
pub mod user;

pub use booking::{Booking, BookingStatus};
pub use seat::{SeatCode, SeatState, SeatStateKind};
pub use show::{SeatInfo, Show, ShowLayout};
pub use user::User;
