use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::is_space,
    combinator::opt,
    multi::separated_list1,
    IResult,
};

/// An auth challenge from a `WWW-Authenticate` response header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

fn skip_whitespace(input: &[u8]) -> &[u8] {
    let (input, _) = take_while::<_, _, ()>(is_space)(input).expect("infallible");

    input
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.' | b':' | b'/' | b'?' | b'=' | b'&' | b'%' | b'+')
}

fn is_key_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn utf8(raw: &[u8]) -> Result<String, std::str::Utf8Error> {
    std::str::from_utf8(raw).map(ToOwned::to_owned)
}

fn quoted_value(input: &[u8]) -> IResult<&[u8], String> {
    let (input, _) = tag("\"")(input)?;
    let (input, value) = nom::combinator::map_res(take_while(|c| c != b'"'), utf8)(input)?;
    let (input, _) = tag("\"")(input)?;

    Ok((input, value))
}

fn bare_value(input: &[u8]) -> IResult<&[u8], String> {
    nom::combinator::map_res(take_while1(is_token_char), utf8)(input)
}

fn param(input: &[u8]) -> IResult<&[u8], (String, String)> {
    let input = skip_whitespace(input);

    let (input, key) = nom::combinator::map_res(take_while1(is_key_char), utf8)(input)?;
    let (input, _) = tag("=")(input)?;
    // Registries quote parameter values; a few send them bare.
    let (input, value) = alt((quoted_value, bare_value))(input)?;

    Ok((input, (key, value)))
}

fn params(input: &[u8]) -> IResult<&[u8], Vec<(String, String)>> {
    separated_list1(tag(","), param)(input)
}

fn lookup(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
}

fn bearer_challenge(input: &[u8]) -> IResult<&[u8], Challenge> {
    let input = skip_whitespace(input);

    let (input, _) = tag_no_case("bearer")(input)?;
    let input = skip_whitespace(input);
    let (input, params) = params(input)?;

    let realm = lookup(&params, "realm").ok_or_else(|| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;

    Ok((
        input,
        Challenge::Bearer {
            realm,
            service: lookup(&params, "service"),
            scope: lookup(&params, "scope"),
        },
    ))
}

fn basic_challenge(input: &[u8]) -> IResult<&[u8], Challenge> {
    let input = skip_whitespace(input);

    let (input, _) = tag_no_case("basic")(input)?;
    let input = skip_whitespace(input);
    let (input, params) = opt(params)(input)?;

    Ok((
        input,
        Challenge::Basic {
            realm: params.as_deref().and_then(|params| lookup(params, "realm")),
        },
    ))
}

fn challenge(input: &[u8]) -> IResult<&[u8], Challenge> {
    alt((bearer_challenge, basic_challenge))(input)
}

/// Parse a `WWW-Authenticate` header value. Returns `None` when the
/// scheme is neither `Bearer` nor `Basic` or the value is malformed.
pub(crate) fn parse(raw: &[u8]) -> Option<Challenge> {
    challenge(raw).ok().map(|(_, challenge)| challenge)
}
