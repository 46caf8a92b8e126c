use std::borrow::Cow;

/// Render an HTML fragment as a single line of plain text.
///
/// Tags (including `<script>`/`<style>` bodies) are dropped, the common
/// named entities and numeric character references are decoded, and runs of
/// whitespace collapse to one space. The result is trimmed.
pub fn html_to_snippet(html: &str) -> String {
    let text = strip_tags(html);
    let decoded = decode_entities(&text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove markup, replacing each tag with a space so adjacent blocks do not
/// run together.
fn strip_tags(html: &str) -> Cow<'_, str> {
    if !html.contains('<') {
        return Cow::Borrowed(html);
    }

    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        out.push(' ');
        let tag = &rest[open..];

        let Some(close) = tag.find('>') else {
            // Unterminated tag: drop the remainder
            rest = "";
            break;
        };

        let name = tag[1..close]
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        rest = &tag[close + 1..];

        if name == "script" || name == "style" {
            let end_tag = format!("</{}", name);
            rest = match rest.to_ascii_lowercase().find(&end_tag) {
                Some(pos) => match rest[pos..].find('>') {
                    Some(gt) => &rest[pos + gt + 1..],
                    None => "",
                },
                None => "",
            };
        }
    }
    out.push_str(rest);

    Cow::Owned(out)
}

fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];

        // Entities are short; anything longer is a literal ampersand
        let decoded = candidate
            .char_indices()
            .take(12)
            .find(|(_, c)| *c == ';')
            .and_then(|(semi, _)| decode_entity(&candidate[1..semi]).map(|ch| (ch, semi)));

        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &candidate[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);

    Cow::Owned(out)
}

fn decode_entity(entity: &str) -> Option<char> {
    if let Some(num) = entity.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        // Markup characters stay escaped so the output never contains tags
        return char::from_u32(code).filter(|c| *c != '<');
    }

    Some(match entity {
        "amp" => '&',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        _ => return None,
    })
}
