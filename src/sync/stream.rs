use super::feed::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Position {
    #[default]
    BeforeArray,
    InArray,
    AfterArray,
}

/// Cuts a byte stream holding one JSON array into the raw bytes of each
/// top-level element, so a feed of any size is decoded one record at a time.
///
/// Only framing is tracked here (string and escape state plus nesting depth);
/// whether an element is valid JSON is left to the decoder.
#[derive(Debug, Default)]
pub struct ArraySplitter {
    position: Position,
    depth: usize,
    in_string: bool,
    escaped: bool,
    current: Vec<u8>,
}

impl ArraySplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk and returns every element it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FeedError> {
        let mut done = Vec::new();
        for &byte in chunk {
            self.step(byte, &mut done)?;
        }
        Ok(done)
    }

    /// Confirms the array was closed once the stream is exhausted.
    pub fn finish(&self) -> Result<(), FeedError> {
        match self.position {
            Position::AfterArray => Ok(()),
            Position::BeforeArray => Err(FeedError::Framing("feed is empty".into())),
            Position::InArray => Err(FeedError::Framing(
                "feed ended before the array closed".into(),
            )),
        }
    }

    fn step(&mut self, byte: u8, done: &mut Vec<Vec<u8>>) -> Result<(), FeedError> {
        match self.position {
            Position::BeforeArray => match byte {
                b'[' => self.position = Position::InArray,
                // UTF-8 byte order mark
                0xEF | 0xBB | 0xBF => {}
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(FeedError::Framing(format!(
                        "expected JSON array start, found {:?}",
                        other as char
                    )));
                }
            },
            Position::AfterArray => {}
            Position::InArray => self.element_byte(byte, done)?,
        }
        Ok(())
    }

    fn element_byte(&mut self, byte: u8, done: &mut Vec<Vec<u8>>) -> Result<(), FeedError> {
        if self.current.is_empty() {
            match byte {
                b',' => return Ok(()),
                b']' => {
                    self.position = Position::AfterArray;
                    return Ok(());
                }
                b if b.is_ascii_whitespace() => return Ok(()),
                _ => {}
            }
        }

        if self.in_string {
            self.current.push(byte);
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                if self.depth == 0 {
                    self.emit(done);
                }
            }
            return Ok(());
        }

        match byte {
            b'"' => {
                self.in_string = true;
                self.current.push(byte);
            }
            b'{' | b'[' => {
                self.depth += 1;
                self.current.push(byte);
            }
            b'}' | b']' if self.depth > 0 => {
                self.depth -= 1;
                self.current.push(byte);
                if self.depth == 0 {
                    self.emit(done);
                }
            }
            // A bare scalar element ends at the next separator.
            b',' if self.depth == 0 => self.emit(done),
            b']' => {
                self.emit(done);
                self.position = Position::AfterArray;
            }
            b'}' => return Err(FeedError::Framing("unbalanced '}' in feed".into())),
            _ => self.current.push(byte),
        }
        Ok(())
    }

    fn emit(&mut self, done: &mut Vec<Vec<u8>>) {
        while self.current.last().is_some_and(u8::is_ascii_whitespace) {
            self.current.pop();
        }
        if !self.current.is_empty() {
            done.push(std::mem::take(&mut self.current));
        }
    }
}
