use crate::routing::Token;

/// Elements placed on the ring at sorted token positions.
///
/// Lookups walk clockwise: from the first position whose token is `>=` the
/// searched one, wrapping to the lowest token past the end.
#[derive(Debug, Clone)]
pub(crate) struct TokenRing<T> {
    ring: Vec<(Token, T)>,
}

impl<T> TokenRing<T> {
    pub(crate) fn new(entries: impl IntoIterator<Item = (Token, T)>) -> Self {
        let mut ring: Vec<(Token, T)> = entries.into_iter().collect();
        ring.sort_by_key(|(token, _)| *token);
        TokenRing { ring }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(Token, T)> {
        self.ring.iter()
    }

    /// Index of the owner of `token`.
    fn owner_index(&self, token: Token) -> usize {
        match self.ring.binary_search_by(|(t, _)| t.cmp(&token)) {
            Ok(exact) => exact,
            Err(first_greater) if first_greater == self.ring.len() => 0,
            Err(first_greater) => first_greater,
        }
    }

    /// Every element once, clockwise, starting at the owner of `token`.
    pub(crate) fn ring_range(&self, token: Token) -> impl Iterator<Item = &T> {
        let start = if self.ring.is_empty() {
            0
        } else {
            self.owner_index(token)
        };
        self.ring[start..]
            .iter()
            .chain(self.ring[..start].iter())
            .map(|(_, elem)| elem)
    }

    pub(crate) fn get_elem_for_token(&self, token: Token) -> Option<&T> {
        if self.ring.is_empty() {
            return None;
        }
        self.ring.get(self.owner_index(token)).map(|(_, elem)| elem)
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TokenRing;
    use crate::routing::Token;

    fn ring() -> TokenRing<char> {
        TokenRing::new([
            (Token::new(50), 'c'),
            (Token::new(-30), 'a'),
            (Token::new(10), 'b'),
        ])
    }

    #[test]
    fn lookup_takes_first_token_not_smaller() {
        let ring = ring();
        assert_eq!(ring.get_elem_for_token(Token::new(-100)), Some(&'a'));
        assert_eq!(ring.get_elem_for_token(Token::new(-30)), Some(&'a'));
        assert_eq!(ring.get_elem_for_token(Token::new(-29)), Some(&'b'));
        assert_eq!(ring.get_elem_for_token(Token::new(50)), Some(&'c'));
    }

    #[test]
    fn lookup_wraps_past_the_last_token() {
        let ring = ring();
        assert_eq!(ring.get_elem_for_token(Token::new(51)), Some(&'a'));
        assert_eq!(ring.get_elem_for_token(Token::new(i64::MAX)), Some(&'a'));
        assert_eq!(
            ring.ring_range(Token::new(11)).copied().collect::<Vec<_>>(),
            vec!['c', 'a', 'b']
        );
        assert_eq!(
            ring.ring_range(Token::new(60)).copied().collect::<Vec<_>>(),
            vec!['a', 'b', 'c']
        );
    }

    #[test]
    fn empty_ring() {
        let ring: TokenRing<char> = TokenRing::new([]);
        assert!(ring.is_empty());
        assert_eq!(ring.get_elem_for_token(Token::new(0)), None);
        assert_eq!(ring.ring_range(Token::new(0)).count(), 0);
    }
}
