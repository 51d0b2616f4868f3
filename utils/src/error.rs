use core::result;

/// The common result type of the workspace. Both the value and the error
/// default to `()`: failures are reported through the `log` macros at the
/// point of detection, so there is usually nothing left to carry.
pub type Result<T = (), E = ()> = result::Result<T, E>;

/// Convert a `Result` into an `Option`, handing the error to `f` (usually
/// a `log` macro invocation) on the way.
pub trait Ext<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

/// Run `f` (usually a `log` macro invocation) when the option is `None`.
pub trait ExtOpaque<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		if self.is_none() {
			f();
		}

		self
	}
}

pub use Ext as _;
