/// An opaque key identifying one registration with the [`reactor`](crate::reactor).
///
/// Tokens are handed out by [`Reactor::register`](crate::reactor::Reactor::register)
/// and come back unchanged in every readiness event for that registration, so a
/// child's owner never has to remember its own token.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
