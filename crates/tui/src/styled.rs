// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::stdout;

use crossterm::{style::Stylize, tty::IsTty};

macro_rules! impl_method {
    ($method:ident) => {
        fn $method(self) -> <Self as Stylize>::Styled {
            if stdout().is_tty() {
                <Self as Stylize>::$method(self)
            } else {
                self.stylize()
            }
        }
    };
}

/// Colours that collapse to plain text when stdout is not a TTY
pub trait Styled: Stylize {
    impl_method!(bold);
    impl_method!(dim);
    impl_method!(red);
    impl_method!(green);
    impl_method!(yellow);
    impl_method!(blue);
    impl_method!(cyan);
}

impl<T> Styled for T where T: Stylize {}
