// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The `/resolve` JSON API: query parameters in, the well-known DoH JSON
//! shape out. `ct=application/dns-message` flips the response back to
//! wireformat without changing the path.

use serde::Serialize;
use std::str::FromStr;
use trust_dns_proto::{
    op::{Edns, Message, MessageType, OpCode, Query},
    rr::{DNSClass, Name, Record, RecordType},
};

/// One entry of the `Question` array.
#[derive(Debug, Serialize)]
pub struct JsonQuestion {
    /// Queried name.
    pub name: String,
    /// Queried type, numeric.
    #[serde(rename = "type")]
    pub rtype: u16,
}

/// One entry of the `Answer`/`Extra` arrays.
#[derive(Debug, Serialize)]
pub struct JsonRecord {
    /// Owner name.
    pub name: String,
    /// Record type, numeric.
    #[serde(rename = "type")]
    pub rtype: u16,
    /// Record class, numeric.
    pub class: u16,
    /// Remaining time to live.
    #[serde(rename = "TTL")]
    pub ttl: u32,
    /// Presentation-format record data.
    pub data: String,
}

/// The JSON response object.
#[derive(Debug, Serialize)]
pub struct JsonMessage {
    /// RCODE of the response.
    #[serde(rename = "Status")]
    pub status: u16,
    /// Truncation flag.
    #[serde(rename = "TC")]
    pub tc: bool,
    /// Recursion desired.
    #[serde(rename = "RD")]
    pub rd: bool,
    /// Recursion available.
    #[serde(rename = "RA")]
    pub ra: bool,
    /// Authenticated data.
    #[serde(rename = "AD")]
    pub ad: bool,
    /// Checking disabled.
    #[serde(rename = "CD")]
    pub cd: bool,
    /// Question section.
    #[serde(rename = "Question")]
    pub question: Vec<JsonQuestion>,
    /// Answer section.
    #[serde(rename = "Answer")]
    pub answer: Vec<JsonRecord>,
    /// Additional section.
    #[serde(rename = "Extra")]
    pub extra: Vec<JsonRecord>,
}

fn record_json(r: &Record) -> JsonRecord {
    JsonRecord {
        name: r.name().to_utf8(),
        rtype: r.record_type().into(),
        class: r.dns_class().into(),
        ttl: r.ttl(),
        data: r.data().map(ToString::to_string).unwrap_or_default(),
    }
}

/// Serialize `resp` into the JSON body.
pub fn render(resp: &Message) -> serde_json::Result<Vec<u8>> {
    let msg = JsonMessage {
        status: resp.response_code().into(),
        tc: resp.truncated(),
        rd: resp.recursion_desired(),
        ra: resp.recursion_available(),
        ad: resp.authentic_data(),
        cd: resp.checking_disabled(),
        question: resp
            .queries()
            .iter()
            .map(|q| JsonQuestion {
                name: q.name().to_utf8(),
                rtype: q.query_type().into(),
            })
            .collect(),
        answer: resp.answers().iter().map(record_json).collect(),
        extra: resp.additionals().iter().map(record_json).collect(),
    };
    serde_json::to_vec(&msg)
}

/// What the `/resolve` parameters asked for.
pub struct ResolveRequest {
    /// The synthetic query to dispatch.
    pub query: Message,
    /// True when `ct=application/dns-message` asked for a wireformat body.
    pub force_wire: bool,
}

// `type` accepts both mnemonics ("AAAA") and numeric codes ("28").
fn parse_rtype(value: &str) -> Result<RecordType, String> {
    if let Ok(code) = value.parse::<u16>() {
        return Ok(RecordType::from(code));
    }
    RecordType::from_str(&value.to_ascii_uppercase())
        .map_err(|_| format!("unknown record type {:?}", value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "" | "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("invalid boolean {:?} for {}", other, key)),
    }
}

/// Build the synthetic query from a `/resolve` query string.
pub fn resolve_request(raw_query: &str) -> Result<ResolveRequest, String> {
    let mut name = None;
    let mut rtype = RecordType::A;
    let mut class = DNSClass::IN;
    let mut cd = false;
    let mut dnssec_ok = false;
    let mut force_wire = false;

    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        match key.as_ref() {
            "name" => name = Some(value.into_owned()),
            "type" => rtype = parse_rtype(&value)?,
            "qc" => {
                class = DNSClass::from_str(&value.to_ascii_uppercase())
                    .map_err(|_| format!("unknown class {:?}", value))?
            }
            "cd" => cd = parse_bool("cd", &value)?,
            "do" => dnssec_ok = parse_bool("do", &value)?,
            // Structured errors toggle; parsed for compatibility with the
            // public JSON API, the response shape does not change.
            "sde" => {
                parse_bool("sde", &value)?;
            }
            "ct" => force_wire = value.as_ref() == "application/dns-message",
            _ => {}
        }
    }

    let name = name.ok_or_else(|| "the name parameter is required".to_string())?;
    let qname = Name::from_utf8(&name).map_err(|e| format!("invalid name {:?}: {}", name, e))?;

    let mut query = Message::new();
    query
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_checking_disabled(cd);
    let mut q = Query::query(qname, rtype);
    q.set_query_class(class);
    query.add_query(q);

    if dnssec_ok {
        let mut edns = Edns::new();
        edns.set_max_payload(crate::message::MAX_MSG_SIZE as u16);
        edns.set_version(0);
        edns.set_dnssec_ok(true);
        query.set_edns(edns);
    }

    Ok(ResolveRequest { query, force_wire })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use trust_dns_proto::rr::{rdata::A, RData};

    #[test]
    fn minimal_request_defaults_to_a_in() {
        let r = resolve_request("name=example.org").unwrap();
        let q = &r.query.queries()[0];
        assert_eq!(q.name().to_utf8(), "example.org");
        assert_eq!(q.query_type(), RecordType::A);
        assert_eq!(q.query_class(), DNSClass::IN);
        assert!(r.query.recursion_desired());
        assert!(!r.force_wire);
    }

    #[test]
    fn type_accepts_mnemonics_and_numbers() {
        let r = resolve_request("name=example.org&type=AAAA").unwrap();
        assert_eq!(r.query.queries()[0].query_type(), RecordType::AAAA);

        let r = resolve_request("name=example.org&type=28").unwrap();
        assert_eq!(r.query.queries()[0].query_type(), RecordType::AAAA);

        assert!(resolve_request("name=example.org&type=BOGUS").is_err());
    }

    #[test]
    fn name_is_required() {
        assert!(resolve_request("type=A").is_err());
    }

    #[test]
    fn do_flag_creates_an_opt_with_do() {
        let r = resolve_request("name=example.org&do=1").unwrap();
        assert!(r.query.edns().unwrap().dnssec_ok());

        let r = resolve_request("name=example.org").unwrap();
        assert!(r.query.edns().is_none());
    }

    #[test]
    fn ct_switches_to_wireformat() {
        let r = resolve_request("name=example.org&ct=application%2Fdns-message").unwrap();
        assert!(r.force_wire);
    }

    #[test]
    fn rendering_mirrors_the_message() {
        let mut resp = Message::new();
        resp.set_message_type(MessageType::Response)
            .set_recursion_desired(true)
            .set_recursion_available(true);
        resp.add_query(Query::query(
            Name::from_utf8("example.org.").unwrap(),
            RecordType::A,
        ));
        resp.add_answer(Record::from_rdata(
            Name::from_utf8("example.org.").unwrap(),
            100,
            RData::A(A::from(Ipv4Addr::new(0, 0, 0, 0))),
        ));

        let body: serde_json::Value =
            serde_json::from_slice(&render(&resp).unwrap()).unwrap();
        assert_eq!(body["Status"], 0);
        assert_eq!(body["Question"][0]["name"], "example.org.");
        assert_eq!(body["Question"][0]["type"], 1);
        assert_eq!(body["Answer"][0]["TTL"], 100);
        assert_eq!(body["Answer"][0]["data"], "0.0.0.0");
        assert_eq!(body["RD"], true);
    }
}
