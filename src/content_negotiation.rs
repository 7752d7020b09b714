use data_model::MimeType;

#[derive(Debug, Clone, PartialEq)]
struct MediaRange {
    kind: String,
    subtype: String,
    quality: f32,
}

impl MediaRange {
    /// Higher is more specific; the most specific matching range decides the
    /// quality of a type.
    fn specificity(&self, kind: &str, subtype: &str) -> Option<u8> {
        match (self.kind.as_str(), self.subtype.as_str()) {
            ("*", "*") => Some(0),
            (k, "*") if k.eq_ignore_ascii_case(kind) => Some(1),
            (k, s) if k.eq_ignore_ascii_case(kind) && s.eq_ignore_ascii_case(subtype) => Some(2),
            _ => None,
        }
    }
}

/// A parsed `Accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptHeader {
    ranges: Vec<MediaRange>,
}

impl Default for AcceptHeader {
    fn default() -> Self {
        Self::any()
    }
}

impl AcceptHeader {
    pub fn any() -> Self {
        Self {
            ranges: vec![MediaRange {
                kind: "*".to_string(),
                subtype: "*".to_string(),
                quality: 1.0,
            }],
        }
    }

    /// A missing or empty header accepts everything. Unparsable ranges are
    /// skipped.
    pub fn parse(header: Option<&str>) -> Self {
        let Some(header) = header.filter(|h| !h.trim().is_empty()) else {
            return Self::any();
        };
        let ranges = header.split(',').filter_map(parse_range).collect();
        Self { ranges }
    }

    /// Quality of `mime` under the most specific matching range; zero when no
    /// range matches.
    pub fn quality(&self, mime: &str) -> f32 {
        let Some((kind, subtype)) = mime.split_once('/') else {
            return 0.0;
        };
        self.ranges
            .iter()
            .filter_map(|range| range.specificity(kind, subtype).map(|s| (s, range.quality)))
            .max_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)))
            .map(|(_, quality)| quality)
            .unwrap_or(0.0)
    }

    pub fn is_acceptable(&self, mime_type: MimeType) -> bool {
        self.quality(mime_type.as_ref()) > 0.0
    }

    /// Highest quality candidate. Ties keep the candidates' order.
    pub fn best_match(&self, candidates: &[MimeType]) -> Option<MimeType> {
        let mut best: Option<(MimeType, f32)> = None;
        for &candidate in candidates {
            let quality = self.quality(candidate.as_ref());
            if quality <= 0.0 {
                continue;
            }
            if best.is_none_or(|(_, q)| quality > q) {
                best = Some((candidate, quality));
            }
        }
        best.map(|(mime_type, _)| mime_type)
    }
}

fn parse_range(raw: &str) -> Option<MediaRange> {
    let mut parts = raw.split(';').map(str::trim);
    let (kind, subtype) = parts.next()?.split_once('/')?;
    if kind.is_empty() || subtype.is_empty() {
        return None;
    }
    let mut quality = 1.0;
    for param in parts {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("q") {
                quality = value.trim().parse::<f32>().ok()?.clamp(0.0, 1.0);
            }
        }
    }
    Some(MediaRange {
        kind: kind.trim().to_string(),
        subtype: subtype.trim().to_string(),
        quality,
    })
}
