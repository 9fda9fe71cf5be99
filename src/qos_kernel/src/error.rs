//! Error types returned by the setup-time kernel operations
use core::fmt;

/// Result code shared by every error type of the kernel.
#[repr(i8)]
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// A parameter is invalid in a way that is not covered by any other
    /// error codes.
    BadParam = -17,
    /// The object ID does not refer to an existing object.
    BadId = -18,
    /// The owning core's task table is full.
    QueueOverflow = -43,
    /// The target object is in a state that does not allow the operation.
    BadObjectState = -41,
}

impl ResultCode {
    /// Get the short name of the result code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadParam => "BadParam",
            Self::BadId => "BadId",
            Self::QueueOverflow => "QueueOverflow",
            Self::BadObjectState => "BadObjectState",
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $(
                $( #[doc $( $vdoc:tt )*] )*
                $Variant:ident,
            )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $(
                $( #[doc $( $vdoc )*] )*
                $Variant = ResultCode::$Variant as _,
            )*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

define_error! {
    /// Error type for [`Kernel::create_task`](crate::Kernel::create_task).
    pub enum CreateTaskError {
        /// The priority is out of range.
        BadParam,
        /// The core's task table is full.
        QueueOverflow,
    }
}

define_error! {
    /// Error type for [`Kernel::activate_task`](crate::Kernel::activate_task).
    pub enum ActivateTaskError {
        /// The task does not exist.
        BadId,
        /// The task is not dormant.
        BadObjectState,
    }
}
