//! The damage-accumulation monoid.
//!
//! `NoError` is the identity, `Fatal` absorbs everything, and two
//! non-fatal states stay non-fatal.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorState {
    #[default]
    NoError,
    NonFatal,
    Fatal,
}

#[must_use]
pub fn combine_errors(a: ErrorState, b: ErrorState) -> ErrorState {
    match (a, b) {
        (ErrorState::Fatal, _) | (_, ErrorState::Fatal) => ErrorState::Fatal,
        (ErrorState::NonFatal, _) | (_, ErrorState::NonFatal) => ErrorState::NonFatal,
        (ErrorState::NoError, ErrorState::NoError) => ErrorState::NoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STATES: [ErrorState; 3] = [ErrorState::NoError, ErrorState::NonFatal, ErrorState::Fatal];

    fn arb_state() -> impl Strategy<Value = ErrorState> {
        prop::sample::select(&STATES[..])
    }

    #[test]
    fn identity_and_absorption() {
        for s in STATES {
            assert_eq!(combine_errors(ErrorState::NoError, s), s);
            assert_eq!(combine_errors(s, ErrorState::NoError), s);
            assert_eq!(combine_errors(ErrorState::Fatal, s), ErrorState::Fatal);
            assert_eq!(combine_errors(s, ErrorState::Fatal), ErrorState::Fatal);
        }
        assert_eq!(
            combine_errors(ErrorState::NonFatal, ErrorState::NonFatal),
            ErrorState::NonFatal
        );
    }

    proptest! {
        #[test]
        fn associative(a in arb_state(), b in arb_state(), c in arb_state()) {
            prop_assert_eq!(
                combine_errors(combine_errors(a, b), c),
                combine_errors(a, combine_errors(b, c))
            );
        }

        #[test]
        fn commutative(a in arb_state(), b in arb_state()) {
            prop_assert_eq!(combine_errors(a, b), combine_errors(b, a));
        }
    }
}
