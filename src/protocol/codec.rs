//! Binary frame codec for the DHM remote-control protocol.
//!
//! Every frame on the TCP stream starts with a little-endian `i32` command code
//! followed by a payload whose layout is fixed by the command's [`TypeSpec`].
//! There are no frame delimiters and no payload length header, so the reader has
//! to know the layout in advance:
//!
//! | tag | layout                                                              |
//! |-----|---------------------------------------------------------------------|
//! | `i` | `i32`                                                               |
//! | `f` | `f32`                                                               |
//! | `d` | `f64`                                                               |
//! | `s` | `i32` byte length, UTF-8 bytes                                      |
//! | `c` | `i32` count, then per entry `i32` id, `i32` name length, UTF-8 name |
//! | `h` | `i32` height, `i32` width, `i32` stride, `stride * height` bytes    |
//!
//! Encoding builds the frame in a [`BytesMut`]. Decoding reads from any
//! [`AsyncRead`] with `read_exact`, which keeps polling until the declared
//! number of bytes has arrived, however the network splits the segments.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use ndarray::Array2;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for a single string payload.
pub const MAX_STRING_BYTES: usize = 1 << 20;
/// Upper bound for the number of entries in a configuration list.
pub const MAX_CONFIG_ENTRIES: usize = 4096;
/// Upper bound for the raw buffer of a single image (256 MiB).
pub const MAX_IMAGE_BYTES: usize = 1 << 28;

/// Wire type of a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// `i`: little-endian int32
    Int32,
    /// `f`: little-endian float32
    Float32,
    /// `d`: little-endian float64
    Float64,
    /// `s`: int32 byte length followed by UTF-8
    Str,
    /// `c`: int32 count of `(id, name)` entries
    ConfigList,
    /// `h`: height, width and stride followed by the raw rows
    Image,
}

impl TypeTag {
    /// Tag for a format character.
    pub fn from_code(code: char) -> Result<Self, ProtocolError> {
        match code {
            'i' => Ok(TypeTag::Int32),
            'f' => Ok(TypeTag::Float32),
            'd' => Ok(TypeTag::Float64),
            's' => Ok(TypeTag::Str),
            'c' => Ok(TypeTag::ConfigList),
            'h' => Ok(TypeTag::Image),
            other => Err(ProtocolError::UnknownTypeTag(other)),
        }
    }

    /// Format character of the tag.
    pub fn code(self) -> char {
        match self {
            TypeTag::Int32 => 'i',
            TypeTag::Float32 => 'f',
            TypeTag::Float64 => 'd',
            TypeTag::Str => 's',
            TypeTag::ConfigList => 'c',
            TypeTag::Image => 'h',
        }
    }

    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Int32 => "int32",
            TypeTag::Float32 => "float32",
            TypeTag::Float64 => "float64",
            TypeTag::Str => "string",
            TypeTag::ConfigList => "config-list",
            TypeTag::Image => "image",
        }
    }
}

/// Ordered sequence of type tags describing a payload layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeSpec(Vec<TypeTag>);

impl TypeSpec {
    /// Parses a compact format string such as `"ii"` or `"h"`.
    pub fn parse(codes: &str) -> Result<Self, ProtocolError> {
        codes
            .chars()
            .map(TypeTag::from_code)
            .collect::<Result<Vec<_>, _>>()
            .map(TypeSpec)
    }

    /// Layout of a payload without values.
    pub fn empty() -> Self {
        TypeSpec(Vec::new())
    }

    /// Tags in wire order.
    pub fn tags(&self) -> &[TypeTag] {
        &self.0
    }

    /// Number of values in the payload.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for payloads without values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<TypeTag> for TypeSpec {
    fn from(tag: TypeTag) -> Self {
        TypeSpec(vec![tag])
    }
}

impl From<Vec<TypeTag>> for TypeSpec {
    fn from(tags: Vec<TypeTag>) -> Self {
        TypeSpec(tags)
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tag in &self.0 {
            write!(f, "{}", tag.code())?;
        }
        Ok(())
    }
}

/// One entry of the server's configuration list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigItem {
    /// Configuration ID as used by the `Config` property
    pub id: i32,
    /// Display name, e.g. the objective
    pub name: String,
}

/// Bytes per pixel of a camera image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    /// One byte per pixel
    Mono8,
    /// Two little-endian bytes per pixel
    Mono16,
}

impl PixelDepth {
    /// Bytes per pixel.
    pub fn bytes(self) -> usize {
        match self {
            PixelDepth::Mono8 => 1,
            PixelDepth::Mono16 => 2,
        }
    }

    /// Infers the element width from the `stride / width` ratio.
    pub fn from_layout(width: usize, stride: usize) -> Result<Self, ProtocolError> {
        if width == 0 {
            return Err(ProtocolError::InvalidPixelDepth { width, stride });
        }
        match stride / width {
            1 => Ok(PixelDepth::Mono8),
            2 => Ok(PixelDepth::Mono16),
            _ => Err(ProtocolError::InvalidPixelDepth { width, stride }),
        }
    }
}

/// A camera image as transferred on the wire.
///
/// `stride` is the number of bytes per row in the raw buffer; any bytes after
/// `width * depth` are row padding and are dropped when decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    stride: usize,
    depth: PixelDepth,
    pixels: Array2<u16>,
}

impl ImagePayload {
    /// Wraps pixels with a tightly packed stride.
    pub fn new(pixels: Array2<u16>, depth: PixelDepth) -> Self {
        let stride = pixels.ncols() * depth.bytes();
        Self {
            stride,
            depth,
            pixels,
        }
    }

    /// Wraps pixels with an explicit row stride.
    pub fn with_stride(
        pixels: Array2<u16>,
        depth: PixelDepth,
        stride: usize,
    ) -> Result<Self, ProtocolError> {
        let width = pixels.ncols();
        if PixelDepth::from_layout(width, stride)? != depth {
            return Err(ProtocolError::InvalidPixelDepth { width, stride });
        }
        Ok(Self {
            stride,
            depth,
            pixels,
        })
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// Number of pixels per row.
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Bytes per row in the raw buffer.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Element width of the raw buffer.
    pub fn depth(&self) -> PixelDepth {
        self.depth
    }

    /// Pixels as a row-major `height x width` array.
    pub fn pixels(&self) -> &Array2<u16> {
        &self.pixels
    }

    /// Consumes the payload, returning its pixels.
    pub fn into_pixels(self) -> Array2<u16> {
        self.pixels
    }

    /// Size of the raw buffer on the wire.
    pub fn byte_len(&self) -> usize {
        self.stride * self.height()
    }
}

/// A decoded (or to-be-encoded) payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// int32 scalar
    Int32(i32),
    /// float32 scalar
    Float32(f32),
    /// float64 scalar
    Float64(f64),
    /// UTF-8 string
    Str(String),
    /// Configuration list
    ConfigList(Vec<ConfigItem>),
    /// Camera image
    Image(ImagePayload),
}

impl Value {
    /// Wire type of the value.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Int32(_) => TypeTag::Int32,
            Value::Float32(_) => TypeTag::Float32,
            Value::Float64(_) => TypeTag::Float64,
            Value::Str(_) => TypeTag::Str,
            Value::ConfigList(_) => TypeTag::ConfigList,
            Value::Image(_) => TypeTag::Image,
        }
    }

    /// Numeric view of scalar values, used for loosely typed reads.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ImagePayload> for Value {
    fn from(v: ImagePayload) -> Self {
        Value::Image(v)
    }
}

/// Builds a complete frame: command code followed by `values` laid out per `spec`.
pub fn encode(command: i32, values: &[Value], spec: &TypeSpec) -> Result<Bytes, ProtocolError> {
    if values.len() != spec.len() {
        return Err(ProtocolError::ValueCount {
            expected: spec.len(),
            got: values.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(4 + encoded_len(values));
    buf.put_i32_le(command);
    for (index, (value, tag)) in values.iter().zip(spec.tags()).enumerate() {
        if value.tag() != *tag {
            return Err(ProtocolError::ArgumentType {
                index,
                expected: tag.code(),
            });
        }
        encode_value(&mut buf, value)?;
    }
    Ok(buf.freeze())
}

fn encoded_len(values: &[Value]) -> usize {
    values
        .iter()
        .map(|value| match value {
            Value::Int32(_) | Value::Float32(_) => 4,
            Value::Float64(_) => 8,
            Value::Str(s) => 4 + s.len(),
            Value::ConfigList(items) => 4 + items.iter().map(|i| 8 + i.name.len()).sum::<usize>(),
            Value::Image(image) => 12 + image.byte_len(),
        })
        .sum()
}

fn put_length(
    buf: &mut BytesMut,
    what: &'static str,
    length: usize,
    max: usize,
) -> Result<(), ProtocolError> {
    if length > max {
        return Err(ProtocolError::LengthOutOfBounds {
            what,
            length: i64::try_from(length).unwrap_or(i64::MAX),
            max,
        });
    }
    // max is always well below i32::MAX
    buf.put_i32_le(length as i32);
    Ok(())
}

fn encode_value(buf: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Float32(v) => buf.put_f32_le(*v),
        Value::Float64(v) => buf.put_f64_le(*v),
        Value::Str(s) => {
            put_length(buf, "string", s.len(), MAX_STRING_BYTES)?;
            buf.put_slice(s.as_bytes());
        }
        Value::ConfigList(items) => {
            put_length(buf, "config list", items.len(), MAX_CONFIG_ENTRIES)?;
            for item in items {
                buf.put_i32_le(item.id);
                put_length(buf, "config name", item.name.len(), MAX_STRING_BYTES)?;
                buf.put_slice(item.name.as_bytes());
            }
        }
        Value::Image(image) => {
            put_length(buf, "image height", image.height(), MAX_IMAGE_BYTES)?;
            put_length(buf, "image width", image.width(), MAX_IMAGE_BYTES)?;
            put_length(buf, "image stride", image.stride(), MAX_IMAGE_BYTES)?;
            if image.byte_len() > MAX_IMAGE_BYTES {
                return Err(ProtocolError::LengthOutOfBounds {
                    what: "image buffer",
                    length: image.byte_len() as i64,
                    max: MAX_IMAGE_BYTES,
                });
            }
            let padding = image.stride() - image.width() * image.depth().bytes();
            for row in image.pixels().rows() {
                match image.depth() {
                    PixelDepth::Mono8 => {
                        for &px in row {
                            buf.put_u8(px.min(u16::from(u8::MAX)) as u8);
                        }
                    }
                    PixelDepth::Mono16 => {
                        for &px in row {
                            buf.put_u16_le(px);
                        }
                    }
                }
                buf.put_bytes(0, padding);
            }
        }
    }
    Ok(())
}

/// Reads the leading command code of a frame.
pub async fn read_code<R>(reader: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i32_le().await?)
}

/// Reads the payload values following a command code.
pub async fn read_values<R>(reader: &mut R, spec: &TypeSpec) -> Result<Vec<Value>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut values = Vec::with_capacity(spec.len());
    for tag in spec.tags() {
        values.push(read_value(reader, *tag).await?);
    }
    Ok(values)
}

/// Reads a complete frame laid out per `spec`.
pub async fn decode<R>(reader: &mut R, spec: &TypeSpec) -> Result<(i32, Vec<Value>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let code = read_code(reader).await?;
    let values = read_values(reader, spec).await?;
    Ok((code, values))
}

async fn read_length<R>(reader: &mut R, what: &'static str, max: usize) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_i32_le().await?;
    match usize::try_from(length) {
        Ok(n) if n <= max => Ok(n),
        _ => Err(ProtocolError::LengthOutOfBounds {
            what,
            length: i64::from(length),
            max,
        }),
    }
}

async fn read_string<R>(reader: &mut R, what: &'static str) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader, what, MAX_STRING_BYTES).await?;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;
    // The server sends UTF-8; tolerate stray bytes rather than dropping the connection.
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

async fn read_value<R>(reader: &mut R, tag: TypeTag) -> Result<Value, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let value = match tag {
        TypeTag::Int32 => Value::Int32(reader.read_i32_le().await?),
        TypeTag::Float32 => Value::Float32(reader.read_f32_le().await?),
        TypeTag::Float64 => Value::Float64(reader.read_f64_le().await?),
        TypeTag::Str => Value::Str(read_string(reader, "string").await?),
        TypeTag::ConfigList => {
            let count = read_length(reader, "config list", MAX_CONFIG_ENTRIES).await?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let id = reader.read_i32_le().await?;
                let name = read_string(reader, "config name").await?;
                items.push(ConfigItem { id, name });
            }
            Value::ConfigList(items)
        }
        TypeTag::Image => Value::Image(read_image(reader).await?),
    };
    Ok(value)
}

async fn read_image<R>(reader: &mut R) -> Result<ImagePayload, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let height = read_length(reader, "image height", MAX_IMAGE_BYTES).await?;
    let width = read_length(reader, "image width", MAX_IMAGE_BYTES).await?;
    let stride = read_length(reader, "image stride", MAX_IMAGE_BYTES).await?;
    let depth = PixelDepth::from_layout(width, stride)?;

    let total = stride.saturating_mul(height);
    if total > MAX_IMAGE_BYTES {
        return Err(ProtocolError::LengthOutOfBounds {
            what: "image buffer",
            length: total as i64,
            max: MAX_IMAGE_BYTES,
        });
    }

    let mut raw = vec![0u8; total];
    reader.read_exact(&mut raw).await?;

    let pixels = Array2::from_shape_fn((height, width), |(y, x)| {
        let offset = y * stride + x * depth.bytes();
        match depth {
            PixelDepth::Mono8 => u16::from(raw[offset]),
            PixelDepth::Mono16 => u16::from_le_bytes([raw[offset], raw[offset + 1]]),
        }
    });

    Ok(ImagePayload {
        stride,
        depth,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tokio_test::io::Builder;

    #[test]
    fn test_type_spec_parse() {
        let spec = TypeSpec::parse("ifdsch").unwrap();
        assert_eq!(spec.len(), 6);
        assert_eq!(spec.to_string(), "ifdsch");
        assert!(matches!(
            TypeSpec::parse("ix"),
            Err(ProtocolError::UnknownTypeTag('x'))
        ));
    }

    #[test]
    fn test_encode_layout_is_little_endian() {
        let spec = TypeSpec::parse("is").unwrap();
        let frame = encode(0x01020304, &[Value::Int32(-2), Value::from("µm")], &spec).unwrap();
        let mut expected = vec![0x04, 0x03, 0x02, 0x01, 0xfe, 0xff, 0xff, 0xff, 3, 0, 0, 0];
        expected.extend_from_slice("µm".as_bytes());
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn test_encode_rejects_mismatched_values() {
        let spec = TypeSpec::parse("i").unwrap();
        assert!(matches!(
            encode(1, &[Value::Float64(1.0)], &spec),
            Err(ProtocolError::ArgumentType {
                index: 0,
                expected: 'i'
            })
        ));
        assert!(matches!(
            encode(1, &[], &spec),
            Err(ProtocolError::ValueCount {
                expected: 1,
                got: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_decode_scalars_and_strings() {
        let spec = TypeSpec::parse("ifds").unwrap();
        let values = vec![
            Value::Int32(27182),
            Value::Float32(1.5),
            Value::Float64(0.6328),
            Value::from("Objective 10x, NA 0.30"),
        ];
        let frame = encode(0x3961955f, &values, &spec).unwrap();
        let mut reader = &frame[..];
        let (code, decoded) = decode(&mut reader, &spec).await.unwrap();
        assert_eq!(code, 0x3961955f);
        assert_eq!(decoded, values);
    }

    #[tokio::test]
    async fn test_decode_config_list() {
        let spec = TypeSpec::parse("c").unwrap();
        let items = vec![
            ConfigItem {
                id: 137,
                name: "10x".to_string(),
            },
            ConfigItem {
                id: 138,
                name: "20x Mirau".to_string(),
            },
        ];
        let frame = encode(0x10b2b1b4, &[Value::ConfigList(items.clone())], &spec).unwrap();
        let mut reader = &frame[..];
        let (_, decoded) = decode(&mut reader, &spec).await.unwrap();
        assert_eq!(decoded, vec![Value::ConfigList(items)]);
    }

    #[tokio::test]
    async fn test_image_split_across_partial_reads() {
        let pixels = array![[1u16, 2, 3], [4, 5, 600], [7, 8, 9000]];
        let image = ImagePayload::with_stride(pixels.clone(), PixelDepth::Mono16, 8).unwrap();
        let spec = TypeSpec::parse("h").unwrap();
        let frame = encode(0x55f1cfac, &[Value::Image(image)], &spec).unwrap();
        assert_eq!(frame.len(), 4 + 12 + 8 * 3);

        let mut builder = Builder::new();
        for chunk in frame.chunks(5) {
            builder.read(chunk);
        }
        let mut reader = builder.build();
        let (code, decoded) = decode(&mut reader, &spec).await.unwrap();
        assert_eq!(code, 0x55f1cfac);
        match &decoded[0] {
            Value::Image(img) => {
                assert_eq!(img.pixels(), &pixels);
                assert_eq!(img.depth(), PixelDepth::Mono16);
                assert_eq!(img.stride(), 8);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eight_bit_image_with_padding() {
        let pixels = array![[10u16, 20, 30], [40, 50, 255]];
        let image = ImagePayload::with_stride(pixels.clone(), PixelDepth::Mono8, 4).unwrap();
        let frame = encode(1, &[Value::Image(image)], &TypeTag::Image.into()).unwrap();
        let mut reader = &frame[..];
        let (_, decoded) = decode(&mut reader, &TypeTag::Image.into()).await.unwrap();
        assert_eq!(decoded[0].tag(), TypeTag::Image);
        if let Value::Image(img) = &decoded[0] {
            assert_eq!(img.pixels(), &pixels);
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_is_connection_closed() {
        let frame = encode(1, &[Value::from("truncated")], &TypeTag::Str.into()).unwrap();
        let mut reader = &frame[..frame.len() - 3];
        let err = decode(&mut reader, &TypeTag::Str.into()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_insane_lengths_are_rejected() {
        let mut raw = BytesMut::new();
        raw.put_i32_le(1);
        raw.put_i32_le(-5);
        let mut reader = &raw[..];
        let err = decode(&mut reader, &TypeTag::Str.into()).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::LengthOutOfBounds { length: -5, .. }
        ));

        let mut raw = BytesMut::new();
        raw.put_i32_le(1);
        raw.put_i32_le(4);
        raw.put_i32_le(4);
        raw.put_i32_le(12);
        let mut reader = &raw[..];
        let err = decode(&mut reader, &TypeTag::Image.into()).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPixelDepth {
                width: 4,
                stride: 12
            }
        ));
    }
}
