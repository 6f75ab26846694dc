//! Kinded paths into the virtual document tree.
//!
//! A path is a sequence of segments. The textual form separates segments
//! with `/` (a leading `/` is accepted and ignored) or `.`; a segment is a
//! map key, an array index in brackets, or a keyed-array lookup in braces:
//!
//! ```text
//! users/alice        users.alice        (two map keys)
//! xs[3]              (key "xs", then array index 3)
//! rows{r1}/name      (key "rows", keyed lookup "r1", key "name")
//! ```
//!
//! Identity is the segment sequence itself -- two spellings of the same
//! segments are the same path.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    #[error("empty segment in path {0:?}")]
    EmptySegment(String),
    #[error("invalid array index {index:?} in path {path:?}")]
    BadIndex { path: String, index: String },
    #[error("unclosed {open:?} in path {path:?}")]
    Unclosed { path: String, open: char },
    #[error("unexpected character {ch:?} after {after:?} in path {path:?}")]
    TrailingGarbage { path: String, after: String, ch: char },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSeg {
    /// Map key.
    Key(String),
    /// Array index.
    Index(usize),
    /// Keyed-array lookup (element whose `id` field carries this value).
    Keyed(String),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(key) => write!(f, "{key}"),
            PathSeg::Index(index) => write!(f, "[{index}]"),
            PathSeg::Keyed(key) => write!(f, "{{{key}}}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindedPath {
    segs: SmallVec<[PathSeg; 4]>,
}

impl KindedPath {
    pub fn root() -> Self {
        KindedPath::default()
    }

    pub fn is_root(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn segs(&self) -> &[PathSeg] {
        &self.segs
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn push(&mut self, seg: PathSeg) {
        self.segs.push(seg);
    }

    pub fn child(&self, seg: PathSeg) -> Self {
        let mut segs = self.segs.clone();
        segs.push(seg);
        KindedPath { segs }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segs.is_empty() {
            return None;
        }
        Some(KindedPath {
            segs: self.segs[..self.segs.len() - 1].iter().cloned().collect(),
        })
    }

    /// `true` if `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &KindedPath) -> bool {
        other.segs.len() >= self.segs.len() && other.segs[..self.segs.len()] == self.segs[..]
    }

    /// The remainder of `other` after stripping `self` as a prefix.
    pub fn strip_prefix(&self, other: &KindedPath) -> Option<KindedPath> {
        if !self.is_prefix_of(other) {
            return None;
        }
        Some(KindedPath {
            segs: other.segs[self.segs.len()..].iter().cloned().collect(),
        })
    }

    /// Top-level segment, if any. Commit notifications report these.
    pub fn first(&self) -> Option<&PathSeg> {
        self.segs.first()
    }

    pub fn parse(input: &str) -> Result<Self, PathParseError> {
        let mut segs = SmallVec::new();
        let trimmed = input.strip_prefix('/').unwrap_or(input);
        if trimmed.is_empty() {
            return Ok(KindedPath { segs });
        }

        let mut chars = trimmed.chars().peekable();
        let mut key = String::new();
        let mut seen_any = false;

        // Flush the pending bare key, erroring on `a//b` style holes only
        // when nothing (key, index or keyed lookup) preceded the separator.
        fn flush(
            segs: &mut SmallVec<[PathSeg; 4]>,
            key: &mut String,
            seen_any: &mut bool,
            input: &str,
            at_separator: bool,
        ) -> Result<(), PathParseError> {
            if key.is_empty() {
                if at_separator && !*seen_any {
                    return Err(PathParseError::EmptySegment(input.to_string()));
                }
                return Ok(());
            }
            segs.push(PathSeg::Key(std::mem::take(key)));
            *seen_any = true;
            Ok(())
        }

        while let Some(ch) = chars.next() {
            match ch {
                '/' | '.' => {
                    flush(&mut segs, &mut key, &mut seen_any, input, true)?;
                    seen_any = false;
                }
                '[' => {
                    flush(&mut segs, &mut key, &mut seen_any, input, false)?;
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(digit) => digits.push(digit),
                            None => {
                                return Err(PathParseError::Unclosed {
                                    path: input.to_string(),
                                    open: '[',
                                })
                            }
                        }
                    }
                    let index = digits.parse::<usize>().map_err(|_| PathParseError::BadIndex {
                        path: input.to_string(),
                        index: digits.clone(),
                    })?;
                    segs.push(PathSeg::Index(index));
                    seen_any = true;
                }
                '{' => {
                    flush(&mut segs, &mut key, &mut seen_any, input, false)?;
                    let mut lookup = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(inner) => lookup.push(inner),
                            None => {
                                return Err(PathParseError::Unclosed {
                                    path: input.to_string(),
                                    open: '{',
                                })
                            }
                        }
                    }
                    segs.push(PathSeg::Keyed(lookup));
                    seen_any = true;
                }
                ']' | '}' => {
                    return Err(PathParseError::TrailingGarbage {
                        path: input.to_string(),
                        after: key.clone(),
                        ch,
                    })
                }
                other => key.push(other),
            }
        }
        flush(&mut segs, &mut key, &mut seen_any, input, false)?;

        Ok(KindedPath { segs })
    }
}

impl FromStr for KindedPath {
    type Err = PathParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        KindedPath::parse(input)
    }
}

impl FromIterator<PathSeg> for KindedPath {
    fn from_iter<I: IntoIterator<Item = PathSeg>>(iter: I) -> Self {
        KindedPath {
            segs: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for KindedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segs.is_empty() {
            return write!(f, "/");
        }
        for seg in &self.segs {
            match seg {
                PathSeg::Key(_) => write!(f, "/{seg}")?,
                // Index/keyed segments attach to the previous component.
                _ => write!(f, "{seg}")?,
            }
        }
        Ok(())
    }
}
