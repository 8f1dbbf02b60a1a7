use songbase::database::{FtsTokenizer, UnicodeTokenizer};

pub fn run(text: &str, json: bool) -> bool {
    let tokens = UnicodeTokenizer.tokenize(text);

    if json {
        return match serde_json::to_string_pretty(&tokens) {
            Ok(json) => {
                println!("{}", json);
                true
            }
            Err(e) => {
                eprintln!("Error serializing tokens: {}", e);
                false
            }
        };
    }

    for token in &tokens {
        println!(
            "{:20} {:>4}..{:<4} {}",
            token.text,
            token.start,
            token.end,
            &text[token.start..token.end]
        );
    }
    true
}
