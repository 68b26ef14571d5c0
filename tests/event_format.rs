use insta::assert_json_snapshot;
use pdf_translator_rust::jobs::{JobEvent, JobResult};

#[test]
fn event_wire_format() {
    let events = vec![
        JobEvent::progress(37.5, "translating page 3/8"),
        JobEvent::progress_with_message(99.0, "assembling output", "8 pages"),
        JobEvent::Finish {
            translate_result: JobResult {
                mono_pdf_path: Some("data/outputs/job/paper.zh.mono.pdf".to_string()),
                total_seconds: 12.5,
                pages: 8,
                regions_translated: 41,
            },
        },
        JobEvent::Error {
            error: "failed to load paper.pdf".to_string(),
        },
    ];
    assert_json_snapshot!(events, @r###"
    [
      {
        "type": "progress_update",
        "overall_progress": 37.5,
        "stage": "translating page 3/8"
      },
      {
        "type": "progress_update",
        "overall_progress": 99.0,
        "stage": "assembling output",
        "message": "8 pages"
      },
      {
        "type": "finish",
        "translate_result": {
          "mono_pdf_path": "data/outputs/job/paper.zh.mono.pdf",
          "total_seconds": 12.5,
          "pages": 8,
          "regions_translated": 41
        }
      },
      {
        "type": "error",
        "error": "failed to load paper.pdf"
      }
    ]
    "###);
}
