// Glob patterns over dot-separated metric paths: `a.*.c.{d,e}.**`. Each
// segment is literal, a condition (char set, alternation, embedded `*`/`?`)
// or a full wildcard; `**` spans any number of whole segments.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seg {
	Exact(String),
	Condition(SegMatcher),
	Any,
	DynamicAny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegMatcher {
	tokens: Vec<Tok>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
	Lit(String),
	Star,
	Question,
	CharSet(Vec<u8>),
	Alt(Vec<String>),
}

impl SegMatcher {
	pub fn matches(&self, segment: &str) -> bool {
		match_tokens(&self.tokens, segment.as_bytes())
	}
}

fn match_tokens(tokens: &[Tok], rest: &[u8]) -> bool {
	let Some((tok, tail)) = tokens.split_first() else {
		return rest.is_empty();
	};
	match tok {
		Tok::Lit(lit) => rest
			.strip_prefix(lit.as_bytes())
			.is_some_and(|rest| match_tokens(tail, rest)),
		Tok::Question => !rest.is_empty() && match_tokens(tail, &rest[1..]),
		Tok::CharSet(set) => rest
			.first()
			.is_some_and(|b| set.contains(b) && match_tokens(tail, &rest[1..])),
		Tok::Alt(alts) => alts.iter().any(|alt| {
			rest.strip_prefix(alt.as_bytes())
				.is_some_and(|rest| match_tokens(tail, rest))
		}),
		Tok::Star => (0..=rest.len()).any(|skip| match_tokens(tail, &rest[skip..])),
	}
}

// None when the pattern is malformed (unclosed bracket or brace).
pub(crate) fn parse(pattern: &str) -> Option<Vec<Seg>> {
	pattern.split('.').map(parse_segment).collect()
}

fn parse_segment(segment: &str) -> Option<Seg> {
	if segment == "**" {
		return Some(Seg::DynamicAny);
	}
	if segment == "*" {
		return Some(Seg::Any);
	}
	if !segment.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'{')) {
		return Some(Seg::Exact(segment.to_string()));
	}

	let bytes = segment.as_bytes();
	let mut tokens = Vec::new();
	let mut lit = String::new();
	let mut at = 0;
	while at < bytes.len() {
		match bytes[at] {
			b'*' => {
				flush_lit(&mut tokens, &mut lit);
				tokens.push(Tok::Star);
				at += 1;
			}
			b'?' => {
				flush_lit(&mut tokens, &mut lit);
				tokens.push(Tok::Question);
				at += 1;
			}
			b'[' => {
				flush_lit(&mut tokens, &mut lit);
				let close = segment[at..].find(']')? + at;
				tokens.push(Tok::CharSet(bytes[at + 1..close].to_vec()));
				at = close + 1;
			}
			b'{' => {
				flush_lit(&mut tokens, &mut lit);
				let close = segment[at..].find('}')? + at;
				let alts = segment[at + 1..close]
					.split(',')
					.map(|s| s.to_string())
					.collect();
				tokens.push(Tok::Alt(alts));
				at = close + 1;
			}
			b => {
				lit.push(b as char);
				at += 1;
			}
		}
	}
	flush_lit(&mut tokens, &mut lit);
	Some(Seg::Condition(SegMatcher { tokens }))
}

fn flush_lit(tokens: &mut Vec<Tok>, lit: &mut String) {
	if !lit.is_empty() {
		tokens.push(Tok::Lit(std::mem::take(lit)));
	}
}
