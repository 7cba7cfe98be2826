//! JSON DNS answers as served by JSON-API resolvers.
//! See: <https://developers.google.com/speed/public-dns/docs/doh/json>

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result, anyhow, bail};
use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, NULL, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::txt::RDataParser;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DNS_JSON_CONTENT_TYPE: &str = "application/dns-json";

const MAX_CHARACTER_STRING: usize = 255;

/// JSON representation of a DNS response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonResponse {
    /// Standard DNS response code
    #[serde(rename = "Status", default)]
    pub status: u16,
    #[serde(rename = "TC", default)]
    pub tc: bool,
    #[serde(rename = "RD", default)]
    pub rd: bool,
    #[serde(rename = "RA", default)]
    pub ra: bool,
    /// Whether the response was validated with DNSSEC
    #[serde(rename = "AD", default)]
    pub ad: bool,
    /// Whether the client asked to disable DNSSEC validation
    #[serde(rename = "CD", default)]
    pub cd: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", default, skip_serializing_if = "Vec::is_empty")]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Additional", default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<JsonRecord>,
    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// IP address / scope prefix-length, see RFC 7871
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edns_client_subnet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub question_type: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub data: String,
}

/// Reply skeleton for `request`: same id, opcode, flags and question, rcode ServFail.
pub fn prepare_reply(request: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_checking_disabled(request.checking_disabled());
    reply.set_response_code(ResponseCode::ServFail);
    reply.add_queries(request.queries().to_vec());
    reply
}

impl JsonResponse {
    pub fn response_code(&self) -> ResponseCode {
        self.status.into()
    }

    /// Build the wire reply on top of `skeleton`.
    ///
    /// `udp_size` is `Some` only when the client spoke EDNS0; the reply then
    /// carries an OPT record advertising it, plus the upstream's client-subnet
    /// scope when the query forwarded a subnet with `client_netmask`.
    ///
    /// An answer of the question's own type that cannot be translated turns
    /// the reply into SERVFAIL; an empty NOERROR would be a false NODATA.
    pub fn to_message(
        &self,
        skeleton: &Message,
        udp_size: Option<u16>,
        client_netmask: Option<u8>,
    ) -> Message {
        let mut reply = skeleton.clone();
        reply.set_truncated(self.tc);
        reply.set_authentic_data(self.ad);
        reply.set_checking_disabled(self.cd);
        reply.set_response_code(self.response_code());

        let (answers, skipped) = convert_records(&self.answer);
        let question_type = skeleton.queries().first().map(|query| query.query_type());
        match question_type {
            Some(question_type) if skipped.contains(&question_type) => {
                warn!(
                    record_type = %question_type,
                    "Answer of the queried type is untranslatable; replying SERVFAIL"
                );
                reply.set_response_code(ResponseCode::ServFail);
            }
            _ => {
                reply.insert_answers(answers);
                reply.insert_name_servers(convert_records(&self.authority).0);
                reply.insert_additionals(convert_records(&self.additional).0);
            }
        }

        if let Some(udp_size) = udp_size {
            let mut edns = Edns::new();
            edns.set_max_payload(udp_size);
            edns.set_dnssec_ok(false);
            if let (Some(subnet), Some(netmask)) = (self.edns_client_subnet.as_deref(), client_netmask)
            {
                match parse_subnet(subnet) {
                    Ok((address, scope)) => {
                        edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
                            address, netmask, scope,
                        )));
                    }
                    Err(err) => {
                        warn!(subnet, error = %err, "Ignoring malformed edns_client_subnet");
                    }
                }
            }
            *reply.extensions_mut() = Some(edns);
        }

        reply
    }

    /// Render a finished wire reply for JSON-mode clients.
    pub fn from_message(message: &Message) -> Self {
        let question = message
            .queries()
            .iter()
            .map(|query| JsonQuestion {
                name: query.name().to_ascii(),
                question_type: query.query_type().into(),
            })
            .collect();

        let edns_client_subnet = message
            .extensions()
            .as_ref()
            .and_then(|edns| match edns.option(EdnsCode::Subnet) {
                Some(EdnsOption::Subnet(subnet)) => {
                    Some(format!("{}/{}", subnet.addr(), subnet.scope_prefix()))
                }
                _ => None,
            });

        Self {
            status: message.response_code().into(),
            tc: message.truncated(),
            rd: message.recursion_desired(),
            ra: message.recursion_available(),
            ad: message.authentic_data(),
            cd: message.checking_disabled(),
            question,
            answer: message.answers().iter().map(JsonRecord::from_record).collect(),
            authority: message
                .name_servers()
                .iter()
                .map(JsonRecord::from_record)
                .collect(),
            additional: message
                .additionals()
                .iter()
                .map(JsonRecord::from_record)
                .collect(),
            comment: None,
            edns_client_subnet,
        }
    }
}

impl JsonRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            name: record.name().to_ascii(),
            record_type: record.record_type().into(),
            ttl: record.ttl(),
            data: record.data().to_string(),
        }
    }

    pub fn to_record(&self) -> Result<Record> {
        let name = parse_name(&self.name)?;
        let record_type = RecordType::from(self.record_type);
        let rdata = parse_rdata(record_type, &self.data)
            .with_context(|| format!("bad {record_type} data {:?}", self.data))?;
        Ok(Record::from_rdata(name, self.ttl, rdata))
    }
}

/// Translated records, plus the types of those that had to be skipped.
fn convert_records(records: &[JsonRecord]) -> (Vec<Record>, Vec<RecordType>) {
    let mut converted = Vec::with_capacity(records.len());
    let mut skipped = Vec::new();
    for record in records {
        match record.to_record() {
            Ok(record) => converted.push(record),
            Err(err) => {
                warn!(name = %record.name, error = %format!("{err:#}"), "Skipping untranslatable record");
                skipped.push(RecordType::from(record.record_type));
            }
        }
    }
    (converted, skipped)
}

fn parse_name(raw: &str) -> Result<Name> {
    let mut name = Name::from_ascii(raw.trim())?;
    name.set_fqdn(true);
    Ok(name)
}

fn parse_rdata(record_type: RecordType, data: &str) -> Result<RData> {
    let data = data.trim();
    let rdata = match record_type {
        RecordType::A => RData::A(A(data.parse::<Ipv4Addr>()?)),
        RecordType::AAAA => RData::AAAA(AAAA(data.parse::<Ipv6Addr>()?)),
        RecordType::CNAME => RData::CNAME(CNAME(parse_name(data)?)),
        RecordType::NS => RData::NS(NS(parse_name(data)?)),
        RecordType::PTR => RData::PTR(PTR(parse_name(data)?)),
        RecordType::MX => {
            let [preference, exchange] = fields::<2>(data)?;
            RData::MX(MX::new(preference.parse()?, parse_name(exchange)?))
        }
        RecordType::SRV => {
            let [priority, weight, port, target] = fields::<4>(data)?;
            RData::SRV(SRV::new(
                priority.parse()?,
                weight.parse()?,
                port.parse()?,
                parse_name(target)?,
            ))
        }
        RecordType::SOA => {
            let [mname, rname, serial, refresh, retry, expire, minimum] = fields::<7>(data)?;
            RData::SOA(SOA::new(
                parse_name(mname)?,
                parse_name(rname)?,
                serial.parse()?,
                refresh.parse()?,
                retry.parse()?,
                expire.parse()?,
                minimum.parse()?,
            ))
        }
        RecordType::TXT => RData::TXT(TXT::new(split_character_strings(parse_txt(data)))),
        _ if data.starts_with("\\#") => RData::Unknown {
            code: record_type,
            rdata: NULL::with(parse_generic(data)?),
        },
        other => RData::try_from_str(other, data)?,
    };
    Ok(rdata)
}

/// RFC 3597 generic form: `\# <length> <hex>...`.
fn parse_generic(data: &str) -> Result<Vec<u8>> {
    let mut parts = data.split_whitespace().skip(1);
    let length: usize = parts
        .next()
        .ok_or_else(|| anyhow!("missing rdata length"))?
        .parse()?;
    let bytes = hex::decode(parts.collect::<String>())?;
    if bytes.len() != length {
        bail!("rdata length {length} does not match {} bytes", bytes.len());
    }
    Ok(bytes)
}

/// Character-strings hold at most 255 bytes; longer text becomes several.
fn split_character_strings(strings: Vec<String>) -> Vec<String> {
    let mut split = Vec::with_capacity(strings.len());
    for text in strings {
        if text.len() <= MAX_CHARACTER_STRING {
            split.push(text);
            continue;
        }
        let mut chunk = String::new();
        for ch in text.chars() {
            if chunk.len() + ch.len_utf8() > MAX_CHARACTER_STRING {
                split.push(std::mem::take(&mut chunk));
            }
            chunk.push(ch);
        }
        if !chunk.is_empty() {
            split.push(chunk);
        }
    }
    split
}

fn fields<const N: usize>(data: &str) -> Result<[&str; N]> {
    let parts: Vec<&str> = data.split_whitespace().collect();
    parts
        .try_into()
        .map_err(|parts: Vec<&str>| anyhow!("expected {N} fields, found {}", parts.len()))
}

/// Split `"a" "b c"` style character-strings; bare text is one string.
fn parse_txt(data: &str) -> Vec<String> {
    if !data.starts_with('"') {
        return vec![data.to_string()];
    }
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for ch in data.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' if quoted => {
                strings.push(std::mem::take(&mut current));
                quoted = false;
            }
            '"' => quoted = true,
            _ if quoted => current.push(ch),
            _ => {}
        }
    }
    if quoted && !current.is_empty() {
        strings.push(current);
    }
    strings
}

fn parse_subnet(raw: &str) -> Result<(IpAddr, u8)> {
    let (address, scope) = raw
        .split_once('/')
        .ok_or_else(|| anyhow!("missing prefix length"))?;
    Ok((address.parse()?, scope.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;

    fn request_for(name: &str, rtype: RecordType) -> Message {
        let mut request = Message::new();
        request.set_id(4242);
        request.set_recursion_desired(true);
        request.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
        request
    }

    fn answer_json(records: &str) -> JsonResponse {
        serde_json::from_str(&format!(r#"{{"Status": 0, "Answer": [{records}]}}"#))
            .expect("parse json")
    }

    fn wire_round_trip(reply: &Message) -> Message {
        Message::from_vec(&reply.to_vec().expect("serialise reply")).expect("parse reply")
    }

    const EXAMPLE_A: &str = r#"{
        "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false, "CD": false,
        "Question": [{"name": "example.com.", "type": 1}],
        "Answer": [{"name": "example.com.", "type": 1, "TTL": 3600, "data": "93.184.216.34"}]
    }"#;

    #[test]
    fn example_a_answer_survives_wire_round_trip() {
        let request = request_for("example.com.", RecordType::A);
        let json: JsonResponse = serde_json::from_str(EXAMPLE_A).expect("parse json");

        let reply = json.to_message(&prepare_reply(&request), None, None);
        let bytes = reply.to_vec().expect("serialise reply");
        let unpacked = Message::from_vec(&bytes).expect("parse reply");

        assert_eq!(unpacked.id(), 4242);
        assert_eq!(unpacked.message_type(), MessageType::Response);
        assert_eq!(unpacked.response_code(), ResponseCode::NoError);
        assert_eq!(unpacked.queries(), request.queries());
        assert_eq!(unpacked.answers().len(), 1);
        let answer = &unpacked.answers()[0];
        assert_eq!(answer.name().to_ascii(), "example.com.");
        assert_eq!(answer.record_type(), RecordType::A);
        assert_eq!(answer.ttl(), 3600);
        assert_eq!(
            answer.data(),
            &RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert!(unpacked.extensions().is_none());
    }

    #[test]
    fn skeleton_starts_as_servfail_and_copies_flags() {
        let mut request = request_for("Example.COM.", RecordType::AAAA);
        request.set_checking_disabled(true);
        let reply = prepare_reply(&request);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert!(reply.checking_disabled());
        assert!(reply.recursion_desired());
        assert!(reply.recursion_available());
        assert_eq!(reply.queries()[0].name().to_ascii(), "Example.COM.");
    }

    #[test]
    fn structured_records_are_parsed() {
        let json: JsonResponse = serde_json::from_str(
            r#"{
            "Status": 0,
            "Answer": [
                {"name": "example.com", "type": 15, "TTL": 60, "data": "10 mail.example.com."},
                {"name": "example.com.", "type": 16, "TTL": 60, "data": "\"v=spf1 -all\" \"second \\\"part\\\"\""},
                {"name": "_sip._tcp.example.com.", "type": 33, "TTL": 60, "data": "10 5 5060 sip.example.com."},
                {"name": "example.com.", "type": 48, "TTL": 60, "data": "257 3 13 AAAA"}
            ],
            "Authority": [
                {"name": "example.com.", "type": 6, "TTL": 60,
                 "data": "ns.icann.org. noc.dns.icann.org. 2024010101 7200 3600 1209600 3600"}
            ]
        }"#,
        )
        .expect("parse json");

        let reply = json.to_message(&prepare_reply(&request_for("example.com.", RecordType::ANY)), None, None);

        // DNSKEY is not translated; the rest is.
        assert_eq!(reply.answers().len(), 3);
        assert_eq!(reply.answers()[0].name().to_ascii(), "example.com.");
        match reply.answers()[0].data() {
            RData::MX(mx) => {
                assert_eq!(mx.preference(), 10);
                assert_eq!(mx.exchange().to_ascii(), "mail.example.com.");
            }
            other => panic!("expected MX, got {other:?}"),
        }
        match reply.answers()[1].data() {
            RData::TXT(txt) => {
                let parts: Vec<String> = txt
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect();
                assert_eq!(parts, vec!["v=spf1 -all", "second \"part\""]);
            }
            other => panic!("expected TXT, got {other:?}"),
        }
        assert!(matches!(reply.answers()[2].data(), RData::SRV(srv) if srv.port() == 5060));
        assert!(matches!(reply.name_servers()[0].data(), RData::SOA(soa) if soa.serial() == 2024010101));
    }

    #[test]
    fn edns_is_reattached_with_client_netmask_and_upstream_scope() {
        let json: JsonResponse = serde_json::from_str(
            r#"{"Status": 3, "Comment": "NXDOMAIN", "edns_client_subnet": "198.51.100.0/20"}"#,
        )
        .expect("parse json");
        let request = request_for("missing.example.", RecordType::A);

        let reply = json.to_message(&prepare_reply(&request), Some(1232), Some(24));
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);

        let edns = reply.extensions().as_ref().expect("opt record attached");
        assert_eq!(edns.max_payload(), 1232);
        match edns.option(EdnsCode::Subnet) {
            Some(EdnsOption::Subnet(subnet)) => {
                assert_eq!(subnet.addr(), IpAddr::from([198, 51, 100, 0]));
                assert_eq!(subnet.source_prefix(), 24);
                assert_eq!(subnet.scope_prefix(), 20);
            }
            other => panic!("expected client subnet option, got {other:?}"),
        }
    }

    #[test]
    fn from_message_renders_answers() {
        let request = request_for("example.com.", RecordType::A);
        let json: JsonResponse = serde_json::from_str(EXAMPLE_A).expect("parse json");
        let reply = json.to_message(&prepare_reply(&request), None, None);

        let rendered = JsonResponse::from_message(&reply);
        assert_eq!(rendered.status, 0);
        assert_eq!(rendered.question[0].name, "example.com.");
        assert_eq!(rendered.question[0].question_type, 1);
        assert_eq!(rendered.answer[0].data, "93.184.216.34");
        let text = serde_json::to_string(&rendered).expect("serialise json");
        assert!(text.contains("\"Answer\""));
        assert!(!text.contains("\"Authority\""));
    }

    #[test]
    fn long_txt_strings_are_split_into_character_strings() {
        let long = "k".repeat(300);
        let json = answer_json(&format!(
            r#"{{"name": "sel._domainkey.example.com.", "type": 16, "TTL": 60, "data": "\"{long}\""}},
               {{"name": "sel._domainkey.example.com.", "type": 16, "TTL": 60, "data": "\"v=spf1 -all\""}}"#
        ));
        let request = request_for("sel._domainkey.example.com.", RecordType::TXT);

        let reply = wire_round_trip(&json.to_message(&prepare_reply(&request), None, None));
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 2);
        match reply.answers()[0].data() {
            RData::TXT(txt) => {
                let lengths: Vec<usize> = txt.iter().map(|part| part.len()).collect();
                assert_eq!(lengths, vec![255, 45]);
                assert_eq!(txt.iter().flat_map(|part| part.iter()).count(), 300);
            }
            other => panic!("expected TXT, got {other:?}"),
        }
    }

    #[test]
    fn split_keeps_multibyte_characters_whole() {
        let text = "é".repeat(200);
        let split = split_character_strings(vec![text.clone()]);
        assert!(split.iter().all(|part| part.len() <= MAX_CHARACTER_STRING));
        assert_eq!(split.concat(), text);
    }

    #[test]
    fn zone_text_types_are_translated() {
        let json = answer_json(
            r#"{"name": "example.com.", "type": 257, "TTL": 300, "data": "0 issue \"letsencrypt.org\""},
               {"name": "example.com.", "type": 43, "TTL": 300, "data": "2371 13 2 1F987CC6583E92DF0890718C42"},
               {"name": "example.com.", "type": 44, "TTL": 300, "data": "2 1 123456789abcdef67890123456789abcdef67890"},
               {"name": "_443._tcp.example.com.", "type": 52, "TTL": 300, "data": "3 1 1 0C72AC70B745AC19998811B131D662C9AC69DBDBE7CB23E5B514B56664C5D3D6"}"#,
        );
        let request = request_for("example.com.", RecordType::ANY);

        let reply = wire_round_trip(&json.to_message(&prepare_reply(&request), None, None));
        let types: Vec<RecordType> = reply.answers().iter().map(|r| r.record_type()).collect();
        assert_eq!(
            types,
            vec![RecordType::CAA, RecordType::DS, RecordType::SSHFP, RecordType::TLSA]
        );
    }

    #[test]
    fn generic_rdata_is_carried_opaquely() {
        let json = answer_json(
            r#"{"name": "example.com.", "type": 65280, "TTL": 60, "data": "\\# 4 0a000001"}"#,
        );
        let request = request_for("example.com.", RecordType::Unknown(65280));

        let reply = json.to_message(&prepare_reply(&request), None, None);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        match reply.answers()[0].data() {
            RData::Unknown { code, rdata } => {
                assert_eq!(*code, RecordType::Unknown(65280));
                assert_eq!(rdata.anything(), &[10, 0, 0, 1]);
            }
            other => panic!("expected opaque rdata, got {other:?}"),
        }
        wire_round_trip(&reply);

        let mismatched = answer_json(
            r#"{"name": "example.com.", "type": 65280, "TTL": 60, "data": "\\# 5 0a000001"}"#,
        );
        let reply = mismatched.to_message(&prepare_reply(&request), None, None);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
    }

    #[test]
    fn untranslatable_answer_of_queried_type_is_servfail() {
        let json = answer_json(
            r#"{"name": "example.com.", "type": 48, "TTL": 60, "data": "257 3 13 AAAA"}"#,
        );
        let request = request_for("example.com.", RecordType::DNSKEY);

        let reply = json.to_message(&prepare_reply(&request), None, None);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert!(reply.answers().is_empty());
    }

    #[test]
    fn parse_txt_handles_bare_and_quoted_text() {
        assert_eq!(parse_txt("hello world"), vec!["hello world"]);
        assert_eq!(parse_txt("\"a\" \"b c\""), vec!["a", "b c"]);
    }
}
