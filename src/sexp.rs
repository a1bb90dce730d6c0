//! Value trees ("XT") carried in evaluation replies.
//!
//! A node is one little-endian word packing an 8-bit tag and a 24-bit body
//! length, optionally followed by an attribute node (when the 0x80 flag is
//! set in the tag byte), then the body. Lengths count attribute plus body
//! octets; the header word itself is excluded. There is no padding, so
//! numeric bodies land on arbitrary offsets.

use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;

use byteorder::{ByteOrder, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::proto::ProtocolError;

/// Flag OR'd into the tag byte when an attribute node precedes the body.
pub const XT_HAS_ATTR: u8 = 0x80;

/// Node tags of the value-tree encoding. Do not confuse with the `DT_` tags
/// of the parameter list.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum XtTag {
    /// Empty body.
    Null = 0,
    /// One wire int (never produced by the encoder, accepted on decode).
    Int = 1,
    /// One wire double.
    Double = 2,
    /// NUL-terminated string; the length includes the NUL.
    Str = 3,
    /// Language form; the body is not transmitted in this protocol revision.
    Lang = 4,
    /// Symbol; the body is its print name as a `Str` node.
    Sym = 5,
    /// One logical octet.
    Bool = 6,
    /// Generic vector of child nodes.
    Vector = 16,
    /// Head/tail pair.
    List = 17,
    /// N wire ints.
    ArrayInt = 32,
    /// N wire doubles.
    ArrayDouble = 33,
    /// N NUL-terminated strings (accepted on decode only).
    ArrayStr = 34,
    /// N logical octets.
    ArrayBool = 35,
    /// Carries the evaluator's native type code for anything unmapped.
    Unknown = 48,
}

/// Three-valued logical element. On the wire `FALSE` is 0, `TRUE` is 1 and
/// anything else means "not available".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Logical {
    /// Logical false.
    False,
    /// Logical true.
    True,
    /// Not available.
    Na,
}

impl Logical {
    fn to_wire(self) -> u8 {
        match self {
            Logical::False => 0,
            Logical::True => 1,
            Logical::Na => 2,
        }
    }

    fn from_wire(b: u8) -> Self {
        match b {
            0 => Logical::False,
            1 => Logical::True,
            _ => Logical::Na,
        }
    }
}

/// A value produced by the evaluator, shaped for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Sexp {
    /// The value itself.
    pub kind: Kind,
    /// Optional attribute value (names, dimensions, ...), encoded before the
    /// body.
    pub attr: Option<Box<Sexp>>,
}

/// The tagged sum of value kinds the serializer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    /// The null value.
    Null,
    /// A character scalar (one string element).
    Char(String),
    /// Float vector; a single element encodes as a scalar.
    Doubles(Vec<f64>),
    /// Integer vector; there is no scalar specialization.
    Ints(Vec<i32>),
    /// Logical vector.
    Logicals(Vec<Logical>),
    /// String vector; a single element elides its wrapper on the wire.
    Strings(Vec<String>),
    /// Generic vector.
    Vector(Vec<Sexp>),
    /// Pairlist cell.
    List(Box<Sexp>, Box<Sexp>),
    /// Language form. Content is lost on the wire in this revision.
    Lang,
    /// Symbol with its print name.
    Symbol(String),
    /// Unmapped evaluator value, carrying the native type code.
    Unknown(i32),
}

impl Sexp {
    /// Wrap a kind with no attributes.
    pub fn new(kind: Kind) -> Self {
        Self { kind, attr: None }
    }

    /// The null value.
    pub fn null() -> Self {
        Self::new(Kind::Null)
    }

    /// A language form.
    pub fn lang() -> Self {
        Self::new(Kind::Lang)
    }

    /// A symbol.
    pub fn symbol<S: Into<String>>(name: S) -> Self {
        Self::new(Kind::Symbol(name.into()))
    }

    /// A scalar float.
    pub fn double(x: f64) -> Self {
        Self::new(Kind::Doubles(vec![x]))
    }

    /// A float vector.
    pub fn doubles(xs: Vec<f64>) -> Self {
        Self::new(Kind::Doubles(xs))
    }

    /// An integer vector.
    pub fn ints(xs: Vec<i32>) -> Self {
        Self::new(Kind::Ints(xs))
    }

    /// A logical vector.
    pub fn logicals(ls: Vec<Logical>) -> Self {
        Self::new(Kind::Logicals(ls))
    }

    /// A string vector of length 1.
    pub fn string<S: Into<String>>(s: S) -> Self {
        Self::new(Kind::Strings(vec![s.into()]))
    }

    /// A string vector.
    pub fn strings(ss: Vec<String>) -> Self {
        Self::new(Kind::Strings(ss))
    }

    /// A generic vector.
    pub fn vector(kids: Vec<Sexp>) -> Self {
        Self::new(Kind::Vector(kids))
    }

    /// A pairlist cell.
    pub fn list(head: Sexp, tail: Sexp) -> Self {
        Self::new(Kind::List(Box::new(head), Box::new(tail)))
    }

    /// Attach an attribute value.
    pub fn with_attr(mut self, attr: Sexp) -> Self {
        self.attr = Some(Box::new(attr));
        self
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.put(&mut buf)?;
        Ok(buf)
    }

    /// Decode a buffer holding exactly one value tree.
    pub fn decode(buf: &[u8]) -> Result<Sexp> {
        let (sexp, used) = Self::get(buf)?;
        ensure!(
            used == buf.len(),
            ProtocolError(format!("{} trailing octets after value tree", buf.len() - used))
        );
        Ok(sexp)
    }

    /// Append this value's encoding to `buf`.
    ///
    /// The header word is reserved first and back-patched once the attribute
    /// and body have been written, so nested nodes need a single pass.
    pub fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        // the sole elision of the format: a length-1 string vector is sent
        // as its character element
        if let Kind::Strings(ss) = &self.kind {
            if ss.len() == 1 {
                let node = Sexp {
                    kind: Kind::Char(ss[0].clone()),
                    attr: self.attr.clone(),
                };
                return node.put(buf);
            }
        }

        let hdr = buf.len();
        buf.write_u32::<LE>(0)?;
        if let Some(attr) = &self.attr {
            attr.put(buf)?;
        }
        match &self.kind {
            Kind::Null | Kind::Lang => {}
            Kind::Char(s) => {
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
            Kind::Doubles(xs) => {
                for x in xs {
                    buf.write_f64::<LE>(*x)?;
                }
            }
            Kind::Ints(xs) => {
                for x in xs {
                    buf.write_i32::<LE>(*x)?;
                }
            }
            Kind::Logicals(ls) => {
                for l in ls {
                    buf.push(l.to_wire());
                }
            }
            Kind::Strings(ss) => {
                for s in ss {
                    put_str_node(buf, s)?;
                }
            }
            Kind::Vector(kids) => {
                for kid in kids {
                    kid.put(buf)?;
                }
            }
            Kind::List(head, tail) => {
                head.put(buf)?;
                tail.put(buf)?;
            }
            Kind::Symbol(name) => put_str_node(buf, name)?,
            Kind::Unknown(code) => buf.write_i32::<LE>(*code)?,
        }

        let body = buf.len() - hdr - 4;
        ensure!(
            body <= 0x7fffff,
            ProtocolError(format!("value body of {body} octets exceeds 24-bit length"))
        );
        let mut tag = u8::from(self.tag());
        if self.attr.is_some() {
            tag |= XT_HAS_ATTR;
        }
        LE::write_u32(&mut buf[hdr..hdr + 4], ((body as u32) << 8) | tag as u32);
        Ok(())
    }

    /// Decode one node from the front of `buf`, returning it with the octet
    /// count consumed.
    pub fn get(buf: &[u8]) -> Result<(Sexp, usize)> {
        ensure!(buf.len() >= 4, ProtocolError::new("truncated value tree"));
        let word = LE::read_u32(&buf[..4]);
        let xt = (word & 0xff) as u8;
        let len = (word >> 8) as usize;
        ensure!(
            buf.len() >= 4 + len,
            ProtocolError(format!("value body of {len} octets overruns buffer"))
        );
        let tag = XtTag::try_from(xt & !XT_HAS_ATTR)
            .map_err(|_| ProtocolError(format!("unrecognized value tag {}", xt & !XT_HAS_ATTR)))?;

        let mut body = &buf[4..4 + len];
        let attr = if xt & XT_HAS_ATTR != 0 {
            let (a, used) = Sexp::get(body)?;
            body = &body[used..];
            Some(Box::new(a))
        } else {
            None
        };

        let kind = match tag {
            XtTag::Null => Kind::Null,
            XtTag::Lang => Kind::Lang,
            XtTag::Int => {
                ensure!(body.len() == 4, ProtocolError::new("scalar int body must be 4 octets"));
                Kind::Ints(vec![LE::read_i32(body)])
            }
            XtTag::Double => {
                ensure!(body.len() == 8, ProtocolError::new("scalar double body must be 8 octets"));
                Kind::Doubles(vec![LE::read_f64(body)])
            }
            XtTag::Str => Kind::Char(get_cstr(body)?),
            XtTag::Sym => {
                let (name, used) = Sexp::get(body)?;
                ensure!(
                    used == body.len(),
                    ProtocolError::new("trailing octets after symbol name")
                );
                match name.kind {
                    Kind::Char(s) => Kind::Symbol(s),
                    _ => bail!(ProtocolError::new("symbol name is not a character scalar")),
                }
            }
            XtTag::Bool | XtTag::ArrayBool => {
                Kind::Logicals(body.iter().map(|&b| Logical::from_wire(b)).collect())
            }
            XtTag::Vector => {
                let mut kids = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let (kid, used) = Sexp::get(rest)?;
                    rest = &rest[used..];
                    kids.push(kid);
                }
                Kind::Vector(kids)
            }
            XtTag::List => {
                let (head, used) = Sexp::get(body)?;
                let (tail, used2) = Sexp::get(&body[used..])?;
                ensure!(
                    used + used2 == body.len(),
                    ProtocolError::new("trailing octets after list cell")
                );
                Kind::List(Box::new(head), Box::new(tail))
            }
            XtTag::ArrayInt => {
                ensure!(
                    body.len() % 4 == 0,
                    ProtocolError::new("int array body not a multiple of 4")
                );
                Kind::Ints(body.chunks_exact(4).map(LE::read_i32).collect())
            }
            XtTag::ArrayDouble => {
                ensure!(
                    body.len() % 8 == 0,
                    ProtocolError::new("double array body not a multiple of 8")
                );
                Kind::Doubles(body.chunks_exact(8).map(LE::read_f64).collect())
            }
            XtTag::ArrayStr => {
                let mut elems = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let s = get_cstr(rest)?;
                    rest = &rest[s.len() + 1..];
                    elems.push(s);
                }
                Kind::Strings(elems)
            }
            XtTag::Unknown => {
                ensure!(body.len() == 4, ProtocolError::new("unknown-value body must be 4 octets"));
                Kind::Unknown(LE::read_i32(body))
            }
        };
        Ok((Sexp { kind, attr }, 4 + len))
    }

    fn tag(&self) -> XtTag {
        match &self.kind {
            Kind::Null => XtTag::Null,
            Kind::Char(_) => XtTag::Str,
            Kind::Doubles(xs) => {
                if xs.len() == 1 {
                    XtTag::Double
                } else {
                    XtTag::ArrayDouble
                }
            }
            Kind::Ints(_) => XtTag::ArrayInt,
            Kind::Logicals(ls) => {
                if ls.len() > 1 {
                    XtTag::ArrayBool
                } else {
                    XtTag::Bool
                }
            }
            Kind::Strings(_) | Kind::Vector(_) => XtTag::Vector,
            Kind::List(_, _) => XtTag::List,
            Kind::Lang => XtTag::Lang,
            Kind::Symbol(_) => XtTag::Sym,
            Kind::Unknown(_) => XtTag::Unknown,
        }
    }
}

// character scalar without attributes, used for string-vector elements and
// symbol print names
fn put_str_node(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = s.len() + 1;
    ensure!(
        len <= 0x7fffff,
        ProtocolError::new("string element exceeds 24-bit length")
    );
    buf.write_u32::<LE>(((len as u32) << 8) | u8::from(XtTag::Str) as u32)?;
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn get_cstr(body: &[u8]) -> Result<String> {
    let end = match body.iter().position(|&b| b == 0) {
        Some(end) => end,
        None => bail!(ProtocolError::new("string body lacks NUL terminator")),
    };
    match std::str::from_utf8(&body[..end]) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => bail!(ProtocolError::new("string body is not UTF-8")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Sexp) {
        let buf = v.encode().unwrap();
        assert_eq!(Sexp::decode(&buf).unwrap(), v);
    }

    #[test]
    fn scalar_double_wire_shape() {
        let buf = Sexp::double(2.0).encode().unwrap();
        assert_eq!(buf.len(), 12);
        // tag 2, length 8
        assert_eq!(&buf[..4], &[2, 8, 0, 0]);
        assert_eq!(LE::read_f64(&buf[4..]), 2.0);
    }

    #[test]
    fn length_one_string_vector_elides_wrapper() {
        let buf = Sexp::string("hi").encode().unwrap();
        // a bare STR node: tag 3, length 3 counting the NUL
        assert_eq!(buf, vec![3, 3, 0, 0, b'h', b'i', 0]);
        assert_eq!(
            Sexp::decode(&buf).unwrap(),
            Sexp::new(Kind::Char("hi".into()))
        );
    }

    #[test]
    fn int_array_length_is_4n() {
        let buf = Sexp::ints(vec![1, 2, 3]).encode().unwrap();
        assert_eq!(&buf[..4], &[32, 12, 0, 0]);
        round_trip(Sexp::ints(vec![1, 2, 3]));
        // no scalar specialization on encode
        let buf = Sexp::ints(vec![5]).encode().unwrap();
        assert_eq!(buf[0], 32);
    }

    #[test]
    fn scalar_int_decodes() {
        // XT_INT is accepted even though the encoder never emits it
        let buf = vec![1u8, 4, 0, 0, 7, 0, 0, 0];
        assert_eq!(Sexp::decode(&buf).unwrap(), Sexp::ints(vec![7]));
    }

    #[test]
    fn logical_wire_bytes_and_na() {
        let v = Sexp::logicals(vec![Logical::True, Logical::False, Logical::Na]);
        let buf = v.encode().unwrap();
        assert_eq!(buf, vec![35, 3, 0, 0, 1, 0, 2]);
        round_trip(v);

        // single logical is a scalar BOOL
        let buf = Sexp::logicals(vec![Logical::True]).encode().unwrap();
        assert_eq!(buf, vec![6, 1, 0, 0, 1]);

        // any unrecognized octet decodes to NA, never to true
        let buf = vec![6u8, 1, 0, 0, 9];
        assert_eq!(
            Sexp::decode(&buf).unwrap(),
            Sexp::logicals(vec![Logical::Na])
        );
    }

    #[test]
    fn attribute_precedes_body_and_counts_in_length() {
        let v = Sexp::doubles(vec![1.0, 2.0]).with_attr(Sexp::symbol("dim"));
        let buf = v.encode().unwrap();
        assert_eq!(buf[0], 33 | XT_HAS_ATTR);
        let attr_len = Sexp::symbol("dim").encode().unwrap().len();
        let total = LE::read_u32(&buf[..4]) >> 8;
        assert_eq!(total as usize, attr_len + 16);
        round_trip(v);
    }

    #[test]
    fn string_vector_decodes_as_vector_of_scalars() {
        let buf = Sexp::strings(vec!["a".into(), "b".into()]).encode().unwrap();
        assert_eq!(buf[0], 16);
        let back = Sexp::decode(&buf).unwrap();
        assert_eq!(
            back,
            Sexp::vector(vec![
                Sexp::new(Kind::Char("a".into())),
                Sexp::new(Kind::Char("b".into())),
            ])
        );
    }

    #[test]
    fn nested_round_trips() {
        round_trip(Sexp::null());
        round_trip(Sexp::lang());
        round_trip(Sexp::symbol("pi"));
        round_trip(Sexp::new(Kind::Unknown(99)));
        round_trip(Sexp::list(Sexp::symbol("head"), Sexp::null()));
        round_trip(Sexp::vector(vec![
            Sexp::double(1.5),
            Sexp::ints(vec![1, 2]),
            Sexp::vector(vec![Sexp::null()]),
        ]));
        round_trip(Sexp::doubles(vec![]));
    }

    #[test]
    fn empty_string_array_decodes() {
        let buf = vec![34u8, 0, 0, 0];
        assert_eq!(Sexp::decode(&buf).unwrap(), Sexp::strings(vec![]));
    }

    #[test]
    fn malformed_trees_rejected() {
        assert!(Sexp::decode(&[]).is_err());
        // unrecognized tag
        assert!(Sexp::decode(&[99, 0, 0, 0]).is_err());
        // declared body longer than buffer
        assert!(Sexp::decode(&[2, 8, 0, 0, 1, 2]).is_err());
        // int array with a ragged length
        assert!(Sexp::decode(&[32, 6, 0, 0, 1, 2, 3, 4, 5, 6]).is_err());
        // string without terminator
        assert!(Sexp::decode(&[3, 2, 0, 0, b'h', b'i']).is_err());
    }
}
