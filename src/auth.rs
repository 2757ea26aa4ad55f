use sha2::{Digest, Sha256};

const STRETCH_ROUNDS: u32 = 60_000;

/// Stored form is `salt$hexdigest`. The digest is sha256 iterated over
/// `salt:password`, then over its own output.
pub fn hash_password(plain: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, stretch(&salt, plain))
}

pub fn verify_password(plain: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    stretch(salt, plain) == digest
}

fn stretch(salt: &str, plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(plain.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..STRETCH_ROUNDS {
        let mut h = Sha256::new();
        h.update(digest);
        digest = h.finalize();
    }
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Initial password for generated student logins:
/// name uppercased with whitespace stripped, the last two digits of each
/// batch year, then `@#`. Anything shorter than 6 chars is padded with
/// `123456` and cut to 8.
pub fn generate_password(name: &str, batch: Option<&str>) -> String {
    let name_part: String = name
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let digits = batch.map(batch_digits).unwrap_or_default();
    let mut generated = format!("{}{}@#", name_part, digits);
    if generated.chars().count() < 6 {
        generated.push_str("123456");
        generated = generated.chars().take(8).collect();
    }
    generated
}

/// Reduce a batch string like "2023-2027" (or with an en dash and spaces)
/// to the last two digits of each year: "2327". Unparseable input yields "".
pub fn batch_digits(batch: &str) -> String {
    let chars: Vec<char> = batch.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if let Some(y1) = read_year(&chars, i) {
            let mut j = i + 4;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '-' || chars[j] == '\u{2013}') {
                j += 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if let Some(y2) = read_year(&chars, j) {
                    return format!("{}{}", &y1[2..], &y2[2..]);
                }
            }
        }
        i += 1;
    }
    String::new()
}

fn read_year(chars: &[char], at: usize) -> Option<String> {
    if at + 4 > chars.len() {
        return None;
    }
    if !chars[at..at + 4].iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // A fifth digit means this is not a 4-digit year.
    if at + 4 < chars.len() && chars[at + 4].is_ascii_digit() {
        return None;
    }
    Some(chars[at..at + 4].iter().collect())
}
