pub mod variant;

use url::Url;

use crate::download::range::ByteRange;
use crate::error::ParseError;

/// One media segment listed by a media manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    /// Position in the final output. Media sequence number of the segment,
    /// not necessarily its index in the manifest.
    pub sequence_index: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub duration: Option<f64>,
}

/// One quality option of a master manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRef {
    /// Bits per second, used as the quality measure.
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub manifest_url: Url,
}

impl VariantRef {
    pub fn resolution_label(&self) -> String {
        match self.resolution {
            Some((width, height)) => format!("{width}x{height}"),
            None => "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaManifest {
    pub segments: Vec<SegmentRef>,
}

impl MediaManifest {
    /// Sum of the `#EXTINF` durations, in seconds.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().filter_map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterManifest {
    pub variants: Vec<VariantRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Media(MediaManifest),
    Master(MasterManifest),
}

struct PendingVariant {
    line: usize,
    bandwidth: u64,
    resolution: Option<(u32, u32)>,
}

struct PendingRange {
    line: usize,
    length: u64,
    offset: Option<u64>,
}

/// Parses manifest text fetched from `base_url`.
///
/// Relative URIs are resolved against `base_url`. A manifest without
/// `#EXT-X-ENDLIST` is treated as complete.
pub fn parse(text: &str, base_url: &Url) -> Result<Manifest, ParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());

    match lines.next() {
        None => return Err(ParseError::Empty),
        Some((_, header)) if header.starts_with("#EXTM3U") => {}
        Some(_) => return Err(ParseError::MissingHeader),
    }

    let mut segments: Vec<SegmentRef> = Vec::new();
    let mut variants: Vec<VariantRef> = Vec::new();

    let mut media_sequence = 0u64;
    let mut next_duration: Option<f64> = None;
    let mut next_range: Option<PendingRange> = None;
    let mut next_variant: Option<PendingVariant> = None;
    let mut last_line = 0;

    for (line_no, line) in lines {
        last_line = line_no;

        if !line.starts_with('#') {
            let url = base_url
                .join(line)
                .map_err(|err| ParseError::malformed(line_no, format!("invalid URI {line:?}: {err}")))?;

            if let Some(pending) = next_variant.take() {
                variants.push(VariantRef {
                    bandwidth: pending.bandwidth,
                    resolution: pending.resolution,
                    manifest_url: url,
                });
                continue;
            }

            let byte_range = match next_range.take() {
                Some(pending) => Some(resolve_range(pending, &url, segments.last())?),
                None => None,
            };

            let sequence_index = media_sequence
                .checked_add(segments.len() as u64)
                .ok_or_else(|| ParseError::malformed(line_no, "media sequence number overflows"))?;

            segments.push(SegmentRef {
                sequence_index,
                url,
                byte_range,
                duration: next_duration.take(),
            });
            continue;
        }

        if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or_default().trim();
            let duration = duration
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| ParseError::malformed(line_no, format!("bad #EXTINF duration {duration:?}")))?;
            next_duration = Some(duration);
        } else if let Some(value) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            next_range = Some(parse_range(value, line_no)?);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if !segments.is_empty() {
                return Err(ParseError::malformed(
                    line_no,
                    "#EXT-X-MEDIA-SEQUENCE after the first segment",
                ));
            }
            media_sequence = value.trim().parse().map_err(|_| {
                ParseError::malformed(line_no, format!("bad media sequence {value:?}"))
            })?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            next_variant = Some(parse_stream_inf(value, line_no)?);
        } else if let Some(value) = line.strip_prefix("#EXT-X-KEY:") {
            let attributes = parse_attributes(value);
            let method = attribute(&attributes, "METHOD").unwrap_or_default();
            if method != "NONE" {
                return Err(ParseError::Unsupported(format!(
                    "encrypted segments (METHOD={method})"
                )));
            }
        } else if line.starts_with("#EXT-X-MAP") {
            return Err(ParseError::Unsupported(
                "initialization sections (#EXT-X-MAP)".to_string(),
            ));
        }
        // every other tag or comment is irrelevant for downloading
    }

    if let Some(pending) = next_variant {
        return Err(ParseError::malformed(
            pending.line,
            "#EXT-X-STREAM-INF without a following URI",
        ));
    }

    match (segments.is_empty(), variants.is_empty()) {
        (true, true) => Err(ParseError::Empty),
        (false, true) => Ok(Manifest::Media(MediaManifest { segments })),
        (true, false) => Ok(Manifest::Master(MasterManifest { variants })),
        (false, false) => Err(ParseError::malformed(
            last_line,
            "manifest mixes variant streams and media segments",
        )),
    }
}

fn parse_range(value: &str, line: usize) -> Result<PendingRange, ParseError> {
    let bad = || ParseError::malformed(line, format!("bad #EXT-X-BYTERANGE {value:?}"));

    let (length, offset) = match value.trim().split_once('@') {
        Some((length, offset)) => (length, Some(offset.parse::<u64>().map_err(|_| bad())?)),
        None => (value.trim(), None),
    };
    let length = length.parse::<u64>().map_err(|_| bad())?;
    if length == 0 {
        return Err(bad());
    }
    if let Some(offset) = offset {
        ByteRange::checked(offset, length).ok_or_else(bad)?;
    }

    Ok(PendingRange {
        line,
        length,
        offset,
    })
}

/// A range without an explicit offset continues right after the previous
/// segment's range, which must be on the same resource.
fn resolve_range(
    pending: PendingRange,
    url: &Url,
    previous: Option<&SegmentRef>,
) -> Result<ByteRange, ParseError> {
    let overflow = || ParseError::malformed(pending.line, "#EXT-X-BYTERANGE ends past the addressable size");

    if let Some(offset) = pending.offset {
        return ByteRange::checked(offset, pending.length).ok_or_else(overflow);
    }

    match previous {
        Some(SegmentRef {
            url: prev_url,
            byte_range: Some(prev_range),
            ..
        }) if prev_url == url => ByteRange::checked(prev_range.end(), pending.length).ok_or_else(overflow),
        _ => Err(ParseError::malformed(
            pending.line,
            "#EXT-X-BYTERANGE without offset and no previous range on the same URI",
        )),
    }
}

fn parse_stream_inf(value: &str, line: usize) -> Result<PendingVariant, ParseError> {
    let attributes = parse_attributes(value);

    let bandwidth = attribute(&attributes, "BANDWIDTH")
        .ok_or_else(|| ParseError::malformed(line, "#EXT-X-STREAM-INF without BANDWIDTH"))?;
    let bandwidth = bandwidth
        .parse::<u64>()
        .map_err(|_| ParseError::malformed(line, format!("bad BANDWIDTH {bandwidth:?}")))?;

    let resolution = attribute(&attributes, "RESOLUTION").and_then(|res| {
        let (width, height) = res.split_once(['x', 'X'])?;
        Some((width.parse().ok()?, height.parse().ok()?))
    });

    Ok(PendingVariant {
        line,
        bandwidth,
        resolution,
    })
}

/// Splits an attribute list (`KEY=value,KEY="quoted, value"`) into pairs.
/// Quotes are removed from quoted values.
fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut push = |entry: &str| {
        if let Some((key, value)) = entry.split_once('=') {
            attributes.push((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ));
        }
    };

    for ch in list.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                push(&current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push(&current);

    attributes
}

fn attribute<'a>(attributes: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}
